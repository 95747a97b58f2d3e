//! 通信对象生命周期：状态机、故障通知与批量打开/关闭编排。
//!
//! # 模块定位（Why）
//! - 通道工厂与通道都是“需要打开、需要关闭、可能故障”的资源对象；统一的
//!   [`CommunicationObject`] 契约让批量编排（[`open_all`] / [`close_all`]）与分层传播
//!   不必关心具体类型；
//! - 异步操作统一使用原生 `Future`，截止时间以 [`Deadline`] 传递，保证嵌套调用共享同一预算。
//!
//! # 协作方式（How）
//! - 具体类型持有一个 [`LifecycleCore`] 并实现 [`LifecycleHooks`] 与 [`ManagedCommunicationObject`]，
//!   即可自动获得 [`CommunicationObject`] 实现。

mod fanout;
mod machine;
mod state;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{config::ChannelTimeouts, error::Result, time::Deadline};

pub use fanout::{FanOutReport, close_all, open_all};
pub use machine::{
    FaultHandler, FaultSubscription, LifecycleCore, LifecycleHooks, WeakLifecycleCore,
};
pub use state::CommunicationState;

/// 通信对象契约。
#[async_trait]
pub trait CommunicationObject: Send + Sync + 'static {
    fn label(&self) -> &str;

    fn state(&self) -> CommunicationState;

    async fn open(&self, deadline: Deadline) -> Result<()>;

    async fn close(&self, deadline: Deadline) -> Result<()>;

    /// 强制释放资源并进入 `Closed`，幂等。
    fn abort(&self);

    /// 订阅状态变化。
    fn subscribe(&self) -> watch::Receiver<CommunicationState>;

    /// 注册故障回调，返回的凭据被丢弃时自动注销。
    fn on_fault(&self, handler: FaultHandler) -> FaultSubscription;

    /// 对象的默认超时。
    fn timeouts(&self) -> ChannelTimeouts;

    /// 以默认打开超时打开。
    async fn open_default(&self) -> Result<()> {
        self.open(Deadline::after(self.timeouts().open)).await
    }

    /// 以默认关闭超时关闭。
    async fn close_default(&self) -> Result<()> {
        self.close(Deadline::after(self.timeouts().close)).await
    }
}

/// 以 [`LifecycleCore`] 驱动状态机的对象。
pub trait ManagedCommunicationObject: LifecycleHooks + Send + Sync + 'static {
    fn lifecycle(&self) -> &LifecycleCore;

    fn default_timeouts(&self) -> ChannelTimeouts;
}

#[async_trait]
impl<T> CommunicationObject for T
where
    T: ManagedCommunicationObject,
{
    fn label(&self) -> &str {
        self.lifecycle().label()
    }

    fn state(&self) -> CommunicationState {
        self.lifecycle().state()
    }

    async fn open(&self, deadline: Deadline) -> Result<()> {
        self.lifecycle().open(self, deadline).await
    }

    async fn close(&self, deadline: Deadline) -> Result<()> {
        self.lifecycle().close(self, deadline).await
    }

    fn abort(&self) {
        self.lifecycle().abort(self);
    }

    fn subscribe(&self) -> watch::Receiver<CommunicationState> {
        self.lifecycle().subscribe()
    }

    fn on_fault(&self, handler: FaultHandler) -> FaultSubscription {
        self.lifecycle().on_fault(handler)
    }

    fn timeouts(&self) -> ChannelTimeouts {
        self.default_timeouts()
    }
}

/// 把可选的单次超时换算为截止时间，缺省时取 `fallback`。
pub fn deadline_or(timeout: Option<Duration>, fallback: Duration) -> Deadline {
    Deadline::after(timeout.unwrap_or(fallback))
}
