//! 截止时间工具：把“整体超时预算”换算为每一步调用的剩余时长。
//!
//! # 模块定位（Why）
//! - 通道栈中的建连、握手、读写与批量开关都共享同一个整体预算；每一步都必须以
//!   “截止时间 − 当前时间” 重新计算自己的份额，而不是各自拿到完整的超时值；
//! - 份额已经耗尽时必须立即失败，不能发起时长为零的 IO。
//!
//! # 实现策略（How）
//! - 以 `tokio::time::Instant` 作为单调时钟来源，使测试可以通过 `tokio::time::pause`
//!   获得确定性的时间推进；
//! - `Deadline::never()` 表示无截止时间，对应 `Duration::MAX` 超时。

use std::{fmt, future::Future, time::Duration};

use tokio::time::Instant;

use crate::error::{ChannelError, Result};

/// 一次操作的绝对截止时间。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Deadline {
    instant: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    /// 无截止时间。
    pub const fn never() -> Self {
        Self {
            instant: None,
            budget: None,
        }
    }

    /// 以当前时间加 `timeout` 构造截止时间；溢出时视为无截止时间。
    pub fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(instant) => Self {
                instant: Some(instant),
                budget: Some(timeout),
            },
            None => Self::never(),
        }
    }

    /// 使用给定的绝对时间点构造截止时间。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
            budget: None,
        }
    }

    /// 返回底层时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 构造时传入的原始预算，用于错误描述。
    pub fn original_budget(&self) -> Option<Duration> {
        self.budget
    }

    /// 判断是否已经到期。
    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(instant) => instant <= Instant::now(),
            None => false,
        }
    }

    /// 计算剩余时长，到期后返回零。
    pub fn remaining_or_zero(&self) -> Duration {
        match self.instant {
            Some(instant) => instant.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// 计算本次调用可用的剩余时长。
    ///
    /// # 契约（What）
    /// - 剩余时长为正时返回 `Ok(remaining)`；
    /// - 剩余时长为零时立即返回超时错误，`operation` 写入错误描述；
    /// - 无截止时间时返回 `Duration::MAX`。
    pub fn remaining(&self, operation: &str) -> Result<Duration> {
        let remaining = self.remaining_or_zero();
        if remaining.is_zero() {
            return Err(ChannelError::timeout(operation, self.budget));
        }
        Ok(remaining)
    }

    /// 在截止时间内驱动 `future`，到期时返回超时错误。
    ///
    /// 进入前先做一次 fail-fast 检查，避免发起零时长的操作。
    pub async fn run<F, T>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.remaining(operation)?;
        match self.instant {
            Some(instant) => match tokio::time::timeout_at(instant, future).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::timeout(operation, self.budget)),
            },
            None => future.await,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instant {
            Some(_) => f
                .debug_struct("Deadline")
                .field("remaining", &self.remaining_or_zero())
                .finish(),
            None => f.write_str("Deadline(never)"),
        }
    }
}
