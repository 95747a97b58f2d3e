use std::io;

use spark_channel::{ChannelError, ErrorCategory};

#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.pipe.connect_failed",
    message: "pipe connect",
};
pub(crate) const LOOKUP: OperationKind = OperationKind {
    code: "spark.transport.pipe.lookup_failed",
    message: "pipe name lookup",
};
pub(crate) const PUBLISH: OperationKind = OperationKind {
    code: "spark.transport.pipe.publish_failed",
    message: "pipe name publish",
};

pub(crate) const TIMEOUT_CODE: &str = "spark.transport.pipe.timeout";
pub(crate) const NOT_PUBLISHED_CODE: &str = "spark.transport.pipe.not_published";

pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ChannelError {
    let category = match error.kind() {
        io::ErrorKind::TimedOut => ErrorCategory::Timeout,
        // 套接字文件消失或无人监听：已发布的管道名过期
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => ErrorCategory::EndpointNotFound,
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => ErrorCategory::Configuration,
        _ => ErrorCategory::Communication,
    };
    ChannelError::new(kind.code, format!("{}: {}", kind.message, error), category).with_cause(error)
}

pub(crate) fn timeout_error(kind: OperationKind) -> ChannelError {
    ChannelError::new(
        TIMEOUT_CODE,
        format!("{} timed out", kind.message),
        ErrorCategory::Timeout,
    )
}

pub(crate) fn not_published(target: impl std::fmt::Display) -> ChannelError {
    ChannelError::new(
        NOT_PUBLISHED_CODE,
        format!("no pipe name is published for `{target}`"),
        ErrorCategory::EndpointNotFound,
    )
}
