//! 分层通道：在内层通道之上叠加协议行为。
//!
//! # 教案级注释
//!
//! ## 契约（What）
//! - 外层通道的 `open` / `close` / `abort` 原样传播到内层通道；
//! - 外层在构造时订阅内层的故障通知，内层异步故障时外层随之进入 `Faulted`；
//!   订阅凭据由外层持有，外层释放即注销；
//! - 故障回调只捕获外层状态机的弱引用，不形成引用环。
//!
//! ## 协作方式（How）
//! - 协议行为由 [`ChannelLayer`] 表达；[`OneWayLayer`] 把单向发送映射为“请求 + 空确认”。

use std::{any::TypeId, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    address::EndpointAddress,
    binding::Property,
    channel::{Channel, ChannelFactory, ChannelShape, ChannelTracker, TrackedSlot},
    config::ChannelTimeouts,
    error::{ChannelError, Result},
    lifecycle::{
        CommunicationObject, FaultSubscription, LifecycleCore, LifecycleHooks, ManagedCommunicationObject,
        close_all, deadline_or,
    },
    message::Message,
    time::Deadline,
};

/// 叠加在内层通道之上的协议行为。
#[async_trait]
pub trait ChannelLayer: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    fn shape(&self) -> ChannelShape;

    async fn send(&self, inner: &dyn Channel, message: Message, deadline: Deadline) -> Result<()>;

    async fn request(&self, inner: &dyn Channel, message: Message, deadline: Deadline) -> Result<Message>;
}

/// 单向层：发送即一次请求，服务端必须以空消息确认。
#[derive(Clone, Copy, Debug, Default)]
pub struct OneWayLayer;

#[async_trait]
impl ChannelLayer for OneWayLayer {
    fn name(&self) -> &'static str {
        "one-way"
    }

    fn shape(&self) -> ChannelShape {
        ChannelShape::Output
    }

    async fn send(&self, inner: &dyn Channel, message: Message, deadline: Deadline) -> Result<()> {
        let budget = deadline.remaining("one-way send")?;
        let reply = inner.request(message, Some(budget)).await?;
        if reply.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::protocol_violation(format!(
                "one-way send expected an empty acknowledgement, got action `{}` with {} body bytes",
                reply.action(),
                reply.body().len()
            )))
        }
    }

    async fn request(&self, _inner: &dyn Channel, _message: Message, _deadline: Deadline) -> Result<Message> {
        Err(ChannelError::unsupported("one-way channels do not support requests"))
    }
}

/// 以 [`ChannelLayer`] 包装内层通道。
pub struct LayeredChannel<L: ChannelLayer> {
    core: LifecycleCore,
    layer: L,
    inner: Arc<dyn Channel>,
    timeouts: ChannelTimeouts,
    slot: Option<TrackedSlot>,
    _inner_fault: FaultSubscription,
}

impl<L: ChannelLayer> LayeredChannel<L> {
    /// 构造外层通道并订阅内层故障。`slot` 为工厂登记表中的位置，独立使用时传 `None`。
    pub fn new(
        layer: L,
        inner: Arc<dyn Channel>,
        timeouts: ChannelTimeouts,
        slot: Option<TrackedSlot>,
    ) -> Arc<Self> {
        let core = LifecycleCore::new(format!("{} channel to {}", layer.name(), inner.remote_address()));
        let outer = core.downgrade();
        let inner_fault = inner.on_fault(Arc::new(move || {
            if let Some(core) = outer.upgrade() {
                core.fault();
            }
        }));
        Arc::new(Self {
            core,
            layer,
            inner,
            timeouts,
            slot,
            _inner_fault: inner_fault,
        })
    }

    pub fn inner(&self) -> &Arc<dyn Channel> {
        &self.inner
    }

    fn release_slot(&self) {
        if let Some(slot) = &self.slot {
            slot.release();
        }
    }
}

#[async_trait]
impl<L: ChannelLayer> LifecycleHooks for LayeredChannel<L> {
    async fn on_open(&self, deadline: Deadline) -> Result<()> {
        self.inner.open(deadline).await
    }

    async fn on_close(&self, deadline: Deadline) -> Result<()> {
        self.release_slot();
        self.inner.close(deadline).await
    }

    fn on_abort(&self) {
        self.release_slot();
        self.inner.abort();
    }
}

impl<L: ChannelLayer> ManagedCommunicationObject for LayeredChannel<L> {
    fn lifecycle(&self) -> &LifecycleCore {
        &self.core
    }

    fn default_timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }
}

#[async_trait]
impl<L: ChannelLayer> Channel for LayeredChannel<L> {
    fn shape(&self) -> ChannelShape {
        self.layer.shape()
    }

    fn remote_address(&self) -> &EndpointAddress {
        self.inner.remote_address()
    }

    async fn send(&self, message: Message, timeout: Option<Duration>) -> Result<()> {
        self.core.ensure_opened("send messages")?;
        let deadline = deadline_or(timeout, self.timeouts.send);
        self.layer.send(self.inner.as_ref(), message, deadline).await
    }

    async fn request(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        self.core.ensure_opened("send requests")?;
        let deadline = deadline_or(timeout, self.timeouts.send);
        self.layer.request(self.inner.as_ref(), message, deadline).await
    }

    fn get_property(&self, type_id: TypeId) -> Option<Property> {
        self.inner.get_property(type_id)
    }
}

impl<L: ChannelLayer> fmt::Debug for LayeredChannel<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredChannel")
            .field("layer", &self.layer)
            .field("core", &self.core)
            .finish()
    }
}

/// 单向通道工厂：包装一个请求-应答工厂。
pub struct OneWayChannelFactory {
    core: LifecycleCore,
    inner: Arc<dyn ChannelFactory>,
    tracker: Arc<ChannelTracker>,
}

impl OneWayChannelFactory {
    pub fn new(inner: Arc<dyn ChannelFactory>) -> Arc<Self> {
        Arc::new(Self {
            core: LifecycleCore::new(format!("one-way factory over {}", inner.label())),
            inner,
            tracker: ChannelTracker::new(),
        })
    }

    pub fn inner(&self) -> &Arc<dyn ChannelFactory> {
        &self.inner
    }
}

#[async_trait]
impl LifecycleHooks for OneWayChannelFactory {
    async fn on_open(&self, deadline: Deadline) -> Result<()> {
        self.inner.open(deadline).await
    }

    async fn on_close(&self, deadline: Deadline) -> Result<()> {
        let channels = self.tracker.close();
        let report = close_all(&channels, deadline).await;
        let inner = self.inner.close(deadline).await;
        report.into_result()?;
        inner
    }

    fn on_abort(&self) {
        for channel in self.tracker.close() {
            channel.abort();
        }
        self.inner.abort();
    }
}

impl ManagedCommunicationObject for OneWayChannelFactory {
    fn lifecycle(&self) -> &LifecycleCore {
        &self.core
    }

    fn default_timeouts(&self) -> ChannelTimeouts {
        self.inner.timeouts()
    }
}

impl ChannelFactory for OneWayChannelFactory {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Output
    }

    fn create_channel_with(
        &self,
        address: EndpointAddress,
        timeouts: Option<ChannelTimeouts>,
    ) -> Result<Arc<dyn Channel>> {
        self.core.ensure_opened("create channels")?;
        let timeouts = timeouts.unwrap_or_else(|| self.inner.timeouts());
        let inner = self.inner.create_channel_with(address, Some(timeouts))?;
        let channel = LayeredChannel::new(OneWayLayer, inner, timeouts, Some(self.tracker.reserve()));
        if let Some(slot) = &channel.slot {
            self.tracker
                .track(slot, Arc::clone(&channel) as Arc<dyn Channel>)
                .inspect_err(|_| channel.abort())?;
        }
        Ok(channel)
    }

    fn get_property(&self, type_id: TypeId) -> Option<Property> {
        self.inner.get_property(type_id)
    }
}

impl fmt::Debug for OneWayChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneWayChannelFactory")
            .field("core", &self.core)
            .field("inner", &self.inner.label())
            .finish()
    }
}
