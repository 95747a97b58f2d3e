//! 通道栈统一错误域。
//!
//! # 模块定位（Why）
//! - 绑定流水线、连接池、流装饰器与生命周期编排在不同层次产生故障，需要合流为稳定错误码，
//!   以便调用方按分类决定“重试 / 拆除连接 / 修正配置”；
//! - 流装饰器必须实现 `AsyncRead`/`AsyncWrite`，只能返回 [`io::Error`]，因此这里同时提供
//!   “结构化错误 ⇄ IO 错误”的双向桥接，避免在传输层丢失配额、超时等语义。
//!
//! # 契约（What）
//! - [`ChannelError`]：稳定错误码 + 描述 + [`ErrorCategory`] + 可选底层原因；
//! - [`codes`]：全部内建错误码，命名遵循 `spark.channel.<语义>`；
//! - [`ChannelError::into_io`] / [`ChannelError::from_io`]：跨越 IO trait 边界时保持分类不丢失。
//!
//! # 风险提示（Trade-offs）
//! - `Fatal` 分类只用于透传不可恢复错误，任何层都不得对其二次包装或重试。

use std::{borrow::Cow, error::Error as StdError, fmt, io, time::Duration};

use thiserror::Error;

/// 内建错误码。
pub mod codes {
    pub const CONFIGURATION: &str = "spark.channel.configuration";
    pub const QUOTA_EXCEEDED: &str = "spark.channel.quota_exceeded";
    pub const TIMEOUT: &str = "spark.channel.timeout";
    pub const COMMUNICATION: &str = "spark.channel.communication";
    pub const ENDPOINT_NOT_FOUND: &str = "spark.channel.endpoint_not_found";
    pub const INVALID_STATE: &str = "spark.channel.invalid_state";
    pub const ABORTED: &str = "spark.channel.aborted";
    pub const UNSUPPORTED: &str = "spark.channel.unsupported";
    pub const PROTOCOL_VIOLATION: &str = "spark.channel.protocol_violation";
    pub const UPGRADE_FAILED: &str = "spark.channel.upgrade_failed";
    pub const ENCODING: &str = "spark.channel.encoding";
}

/// 配额被突破的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuotaDirection {
    /// 读取（接收）方向。
    Receive,
    /// 写入（发送）方向。
    Send,
}

impl fmt::Display for QuotaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDirection::Receive => f.write_str("receive"),
            QuotaDirection::Send => f.write_str("send"),
        }
    }
}

/// 错误分类，驱动调用方的处置策略。
///
/// # 契约说明（What）
/// - `Configuration`：绑定元素序列非法、参数越界等，构建期同步暴露，永不重试；
/// - `QuotaExceeded`：携带配置上限与方向，当前操作致命，相关流/连接必须拆除；
/// - `Timeout`：可由调用方重试，但此前获取的资源必须已被释放；
/// - `Communication`：对端重置、意外 EOF 等瞬时故障；
/// - `EndpointNotFound`：端点身份失效（如管道名过期），连接池据此清理缓存；
/// - `InvalidState` / `Aborted`：违反生命周期状态机；
/// - `Fatal`：不可恢复错误，必须原样上抛。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Configuration,
    QuotaExceeded {
        max: u64,
        direction: QuotaDirection,
    },
    Timeout,
    Communication,
    EndpointNotFound,
    InvalidState,
    Aborted,
    Unsupported,
    ProtocolViolation,
    Fatal,
}

/// `ChannelError` 是通道栈所有公开操作的错误形态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让日志、指标与重试策略依据稳定错误码与 [`ErrorCategory`] 做决策，而非解析字符串；
/// - 保留底层原因链（`source()`），便于排障时还原 IO 或握手的原始错误。
///
/// ## 契约（What）
/// - `code`：`'static` 字符串，来自 [`codes`] 或传输 crate 自己的 `spark.transport.*` 命名空间；
/// - `message`：面向排障人员的描述，不包含敏感信息；
/// - `category`：结构化分类；
/// - **后置条件**：实例满足 `Send + Sync + 'static`，可跨任务传递。
///
/// ## 风险与权衡（Trade-offs）
/// - 消息使用 `Cow`，静态文案零分配，动态文案一次分配；
/// - 结构体不做任何日志上报，调用点自行决定是否记录。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct ChannelError {
    code: &'static str,
    message: Cow<'static, str>,
    category: ErrorCategory,
    #[source]
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

/// 通道栈统一返回值别名。
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

impl ChannelError {
    /// 以错误码、描述与分类构造错误。
    pub fn new(
        code: &'static str,
        message: impl Into<Cow<'static, str>>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            category,
            cause: None,
        }
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 配置错误：构建期发现的非法绑定或参数。
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::CONFIGURATION, message, ErrorCategory::Configuration)
    }

    /// 配额超限错误，描述中标明方向与上限。
    pub fn quota_exceeded(max: u64, direction: QuotaDirection) -> Self {
        let message = match direction {
            QuotaDirection::Receive => {
                format!("the maximum received message size quota ({max} bytes) has been exceeded")
            }
            QuotaDirection::Send => {
                format!("the maximum sent message size quota ({max} bytes) has been exceeded")
            }
        };
        Self::new(
            codes::QUOTA_EXCEEDED,
            message,
            ErrorCategory::QuotaExceeded { max, direction },
        )
    }

    /// 超时错误，`operation` 描述被打断的动作。
    pub fn timeout(operation: impl fmt::Display, timeout: Option<Duration>) -> Self {
        let message = match timeout {
            Some(timeout) => format!("{operation} timed out after {timeout:?}"),
            None => format!("{operation} timed out"),
        };
        Self::new(codes::TIMEOUT, message, ErrorCategory::Timeout)
    }

    /// 通信错误。
    pub fn communication(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::COMMUNICATION, message, ErrorCategory::Communication)
    }

    /// 端点不存在或身份已失效。
    pub fn endpoint_not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            codes::ENDPOINT_NOT_FOUND,
            message,
            ErrorCategory::EndpointNotFound,
        )
    }

    /// 生命周期状态非法。
    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INVALID_STATE, message, ErrorCategory::InvalidState)
    }

    /// 对象已被中止。
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::ABORTED, message, ErrorCategory::Aborted)
    }

    /// 通道形态或元素不支持该操作。
    pub fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::UNSUPPORTED, message, ErrorCategory::Unsupported)
    }

    /// 线路数据违反分帧或握手协议。
    pub fn protocol_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            codes::PROTOCOL_VIOLATION,
            message,
            ErrorCategory::ProtocolViolation,
        )
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取结构化分类。
    pub fn category(&self) -> &ErrorCategory {
        &self.category
    }

    /// 是否为超时错误。
    pub fn is_timeout(&self) -> bool {
        matches!(self.category, ErrorCategory::Timeout)
    }

    /// 是否为配额超限错误。
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self.category, ErrorCategory::QuotaExceeded { .. })
    }

    /// 是否为不可恢复错误。
    pub fn is_fatal(&self) -> bool {
        matches!(self.category, ErrorCategory::Fatal)
    }

    /// 调用方是否可以在新的时间预算内重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Timeout | ErrorCategory::Communication
        )
    }

    /// 发生该错误后承载它的连接是否还能回收进池。
    ///
    /// 只有纯粹的状态/配置类错误不会污染连接上的字节流；其余错误一律视为连接不可复用。
    pub fn leaves_connection_reusable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Configuration | ErrorCategory::InvalidState | ErrorCategory::Unsupported
        )
    }

    /// 将结构化错误装入 [`io::Error`]，供 `AsyncRead`/`AsyncWrite` 实现返回。
    pub fn into_io(self) -> io::Error {
        let kind = match self.category {
            ErrorCategory::Timeout => io::ErrorKind::TimedOut,
            ErrorCategory::QuotaExceeded { .. } => io::ErrorKind::InvalidData,
            ErrorCategory::EndpointNotFound => io::ErrorKind::NotFound,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// 从 [`io::Error`] 还原结构化错误。
    ///
    /// # 执行逻辑（How）
    /// 1. 若内部负载本就是 `ChannelError`（由 [`into_io`](Self::into_io) 产生），直接取回；
    /// 2. 否则按 `io::ErrorKind` 推导分类，并把原始 IO 错误挂在 `source()` 上。
    pub fn from_io(operation: &'static str, error: io::Error) -> Self {
        if error
            .get_ref()
            .is_some_and(|inner| inner.is::<ChannelError>())
        {
            if let Some(inner) = error.into_inner()
                && let Ok(channel_error) = inner.downcast::<ChannelError>()
            {
                return *channel_error;
            }
            return Self::communication(format!("{operation} failed"));
        }

        let category = categorize_io_error(&error);
        let code = match category {
            ErrorCategory::Timeout => codes::TIMEOUT,
            ErrorCategory::EndpointNotFound => codes::ENDPOINT_NOT_FOUND,
            _ => codes::COMMUNICATION,
        };
        Self::new(code, format!("{operation}: {error}"), category).with_cause(error)
    }
}

impl From<io::Error> for ChannelError {
    fn from(error: io::Error) -> Self {
        ChannelError::from_io("io", error)
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable => {
            ErrorCategory::EndpointNotFound
        }
        ErrorKind::InvalidData => ErrorCategory::ProtocolViolation,
        ErrorKind::OutOfMemory => ErrorCategory::Fatal,
        _ => ErrorCategory::Communication,
    }
}
