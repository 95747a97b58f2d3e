use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 记录首个零字节读取的装饰器。
///
/// 对端优雅关闭后连接看起来仍然“健康”；传输层在归还连接前查询 [`is_eof`](Self::is_eof)，
/// 已观测到 EOF 的连接一律丢弃，不会回到连接池。
#[derive(Debug)]
pub struct DetectEofStream<S> {
    inner: S,
    eof: bool,
}

impl<S> DetectEofStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, eof: false }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DetectEofStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if had_room && buf.filled().len() == before && !this.eof {
            this.eof = true;
            tracing::debug!("peer closed the stream");
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DetectEofStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn zero_length_read_sets_flag() {
        let mut stream = DetectEofStream::new(&b"ab"[..]);
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.expect("读取数据"), 2);
        assert!(!stream.is_eof());
        assert_eq!(stream.read(&mut buf).await.expect("读取 EOF"), 0);
        assert!(stream.is_eof());
    }
}
