use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ChannelError, QuotaDirection};

/// 读写双向配额装饰器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 防止对端发送超大消息耗尽内存，也防止本端序列化出超过对端上限的消息；
/// - 配额以“拒绝越界调用”的方式前置执行，越界的字节永远不会被提交。
///
/// ## 契约（What）
/// - 读取方向：每次读取把请求长度钳制到剩余配额；配额恰好耗尽后再次读取时，
///   以 1 字节探测内部流：探测到 EOF 则正常返回 0，探测到数据则返回配额错误；
/// - 写入方向：写入长度超过剩余配额时直接返回配额错误，不调用内部流；
/// - 错误以 [`ChannelError::into_io`] 装箱，可经 [`ChannelError::from_io`] 还原；
/// - **不变式**：`bytes_read <= max_read`、`bytes_written <= max_write` 始终成立。
///
/// ## 风险提示（Trade-offs）
/// - 计数器没有内部同步，单个实例同一时刻只能服务一个逻辑操作；
/// - 探测读取消耗的那个越界字节不会被交还，出错后的流只能拆除。
#[derive(Debug)]
pub struct MaxMessageSizeStream<S> {
    inner: S,
    max_read: u64,
    max_write: u64,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> MaxMessageSizeStream<S> {
    pub fn new(inner: S, max_read: u64, max_write: u64) -> Self {
        Self {
            inner,
            max_read,
            max_write,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MaxMessageSizeStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let remaining = this.max_read.saturating_sub(this.bytes_read);
        if remaining == 0 {
            let mut scratch = [0u8; 1];
            let mut probe = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut probe))?;
            if probe.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
            return Poll::Ready(Err(ChannelError::quota_exceeded(
                this.max_read,
                QuotaDirection::Receive,
            )
            .into_io()));
        }

        let allowed = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let dst = buf.initialize_unfilled_to(allowed);
        let mut limited = ReadBuf::new(dst);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
        let filled = limited.filled().len();
        buf.advance(filled);
        this.bytes_read += filled as u64;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MaxMessageSizeStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let remaining = this.max_write.saturating_sub(this.bytes_written);
        if buf.len() as u64 > remaining {
            return Poll::Ready(Err(ChannelError::quota_exceeded(
                this.max_write,
                QuotaDirection::Send,
            )
            .into_io()));
        }
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.bytes_written += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
