use std::io;

use spark_channel::{ChannelError, ErrorCategory};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};

pub(crate) const TIMEOUT_CODE: &str = "spark.transport.tcp.timeout";
pub(crate) const INVALID_ADDRESS_CODE: &str = "spark.transport.tcp.invalid_address";

/// 将 IO 错误映射为 [`ChannelError`]，保留原始错误作为 `source()`。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ChannelError {
    let category = categorize_io_error(&error);
    ChannelError::new(kind.code, format!("{}: {}", kind.message, error), category).with_cause(error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> ChannelError {
    ChannelError::new(
        TIMEOUT_CODE,
        format!("{} timed out", kind.message),
        ErrorCategory::Timeout,
    )
}

/// 构造地址错误。
pub(crate) fn invalid_address(message: impl Into<String>) -> ChannelError {
    ChannelError::new(INVALID_ADDRESS_CODE, message.into(), ErrorCategory::Configuration)
}

/// 连接被拒绝或地址不可达意味着端点身份已失效，连接池据此清理缓存。
fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::AddrNotAvailable
        | ErrorKind::NotFound
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => ErrorCategory::EndpointNotFound,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::InvalidInput => {
            ErrorCategory::Configuration
        }
        _ => ErrorCategory::Communication,
    }
}
