//! 字节流装饰器与可升级流。
//!
//! # 模块定位（Why）
//! - 原始连接（TCP 套接字、Unix 域套接字、内存管道）在进入应用数据交换前需要叠加
//!   配额、超时、EOF 检测与升级握手等能力；每种能力以独立装饰器实现，可任意组合；
//! - 连接池与传输通道只面向擦除后的 [`BoxedStream`]，与具体介质解耦。
//!
//! # 契约（What）
//! - [`DuplexStream`]：`AsyncRead + AsyncWrite + Send + Unpin` 的对象安全别名；
//! - [`MaxMessageSizeStream`]：读写双向独立计数的配额装饰器；
//! - [`TimeoutStream`]：以绝对截止时间约束每一次读写调用；
//! - [`DetectEofStream`]：记录首个零字节读取；
//! - [`upgrade`]：升级握手状态机与身份声明升级实现。

mod eof;
mod quota;
mod timeout;
pub mod upgrade;

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

pub use eof::DetectEofStream;
pub use quota::MaxMessageSizeStream;
pub use timeout::TimeoutStream;

/// 双工字节流的对象安全约束集合。
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl fmt::Debug for dyn DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DuplexStream")
    }
}

/// 擦除具体类型后的双工流。
pub type BoxedStream = Box<dyn DuplexStream>;
