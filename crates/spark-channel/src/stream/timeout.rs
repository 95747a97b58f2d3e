use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Sleep,
};

use crate::{error::ChannelError, time::Deadline};

/// 以绝对截止时间约束读写的装饰器。
///
/// # 契约（What）
/// - 每次 `poll_*` 先重新计算剩余时长，已经耗尽时立即返回超时错误，不触达内部流；
/// - 内部流挂起时由同一截止时间上的定时器兜底，到期后返回超时错误；
/// - 超时错误以 [`ChannelError::into_io`] 装箱，分类为 `Timeout`。
///
/// # 风险提示（Trade-offs）
/// - 超时后内部流可能停在半帧位置，调用方必须丢弃连接而不是归还连接池。
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    deadline: Deadline,
    timer: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, deadline: Deadline) -> Self {
        Self {
            inner,
            deadline,
            timer: None,
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 替换截止时间，已创建的定时器随之失效。
    pub fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
        self.timer = None;
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn check(&mut self, operation: &'static str) -> io::Result<()> {
        self.deadline
            .remaining(operation)
            .map(|_| ())
            .map_err(ChannelError::into_io)
    }

    fn poll_timer(&mut self, cx: &mut Context<'_>, operation: &'static str) -> Poll<io::Error> {
        let Some(instant) = self.deadline.instant() else {
            return Poll::Pending;
        };
        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(instant)));
        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(
                ChannelError::timeout(operation, self.deadline.original_budget()).into_io(),
            ),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check("stream read")?;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => this.poll_timer(cx, "stream read").map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check("stream write")?;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => this.poll_timer(cx, "stream write").map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check("stream flush")?;
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => this.poll_timer(cx, "stream flush").map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check("stream shutdown")?;
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => this.poll_timer(cx, "stream shutdown").map(Err),
        }
    }
}
