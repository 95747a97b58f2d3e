//! 传输通道工厂与请求-应答通道。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 传输阶段位于绑定序列末尾，负责把“连接池 + 会话分帧 + 流装饰器 + 编码器”组合为可用的通道；
//! - 具体介质差异（TCP、Unix 域套接字、内存管道）全部收敛在 [`Connector`] 与
//!   [`EndpointKeyResolver`] 两个接口之后，本模块对介质一无所知。
//!
//! ## 执行逻辑（How）
//! 1. 工厂打开时向注册表查找兼容连接池并持有一份引用；关闭时先批量关闭全部通道，再释放引用；
//! 2. 通道每次请求：借出连接 → 新连接执行会话前导与升级 → 叠加配额与超时装饰器 →
//!    写出信封并读取应答 → 成功则归还连接，失败则丢弃连接；
//! 3. 请求与通道关闭竞争：优雅关闭在截止时间内等待在途请求完成；通道被中止（含关闭超时）时
//!    在途请求立即以 `Aborted` 结束，借出的连接随之丢弃。
//!
//! ## 风险与权衡（Trade-offs）
//! - 连接在一次请求期间独占，不做多路复用；并发请求数受端点容量与溢出策略约束；
//! - 协议违例与致命错误使通道进入 `Faulted`，其余错误只影响当次请求。

use std::{any::TypeId, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    address::EndpointAddress,
    binding::{
        BindingContext, EncoderParameter, MessageEncoding, Property, TransportScheme, UpgradeParameter,
    },
    buffer::{QueuedObjectPool, byte_buffer_pool},
    channel::{Channel, ChannelFactory, ChannelShape, ChannelTracker, TrackedSlot},
    config::{ChannelTimeouts, TransportSettings},
    encoding::{BinaryMessageEncoder, MessageEncoder},
    error::{ChannelError, ErrorCategory, Result},
    framing::{ClientPreamble, Incoming, establish_client_session, read_incoming, write_envelope},
    lifecycle::{LifecycleCore, LifecycleHooks, ManagedCommunicationObject, close_all, deadline_or},
    message::Message,
    pool::{ConnectionPool, ConnectionPoolRegistry, ConnectionPoolSettings, Connector, EndpointKeyResolver, PooledConnection},
    stream::{MaxMessageSizeStream, TimeoutStream, upgrade::{RemoteSecurity, StreamUpgradeProvider}},
    time::Deadline,
};

/// 信封头部：1 字节记录类型 + 4 字节长度。
const ENVELOPE_HEADER_LEN: u64 = 5;
const MAX_IDLE_BUFFERS: usize = 64;

/// 传输 crate 交给通用工厂的介质相关部件。
pub struct TransportFactoryParts {
    pub scheme: &'static str,
    pub connector: Arc<dyn Connector>,
    pub resolver: Arc<dyn EndpointKeyResolver>,
    pub registry: Arc<ConnectionPoolRegistry>,
    pub settings: TransportSettings,
}

impl fmt::Debug for TransportFactoryParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactoryParts")
            .field("scheme", &self.scheme)
            .field("connector", &self.connector)
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .finish()
    }
}

/// 传输元素对外公布的属性：方案名、传输设置与连接池设置。
pub fn transport_property(scheme: &'static str, settings: &TransportSettings, type_id: TypeId) -> Option<Property> {
    if type_id == TypeId::of::<TransportScheme>() {
        Some(Arc::new(TransportScheme(scheme)))
    } else if type_id == TypeId::of::<TransportSettings>() {
        Some(Arc::new(settings.clone()))
    } else if type_id == TypeId::of::<ConnectionPoolSettings>() {
        Some(Arc::new(settings.pool.clone()))
    } else {
        None
    }
}

struct FactoryShared {
    scheme: &'static str,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn EndpointKeyResolver>,
    registry: Arc<ConnectionPoolRegistry>,
    settings: TransportSettings,
    timeouts: ChannelTimeouts,
    declared: BindingContext,
    encoder: Arc<dyn MessageEncoder>,
    upgrade: Option<StreamUpgradeProvider>,
    buffers: QueuedObjectPool<Vec<u8>>,
    pool: Mutex<Option<Arc<ConnectionPool>>>,
    tracker: Arc<ChannelTracker>,
}

/// 终端传输工厂，只提供请求-应答通道。
pub struct TransportChannelFactory {
    core: LifecycleCore,
    shared: Arc<FactoryShared>,
}

impl TransportChannelFactory {
    /// 由传输元素在 `build_channel_factory` 中调用。
    ///
    /// 从参数袋读取编码器（缺省为二进制编码）与可选的升级提供者。
    pub fn build(
        context: BindingContext,
        shape: ChannelShape,
        parts: TransportFactoryParts,
    ) -> Result<Arc<dyn ChannelFactory>> {
        if shape != ChannelShape::Request {
            return Err(ChannelError::configuration(format!(
                "{} transport only builds request channel factories, not {shape:?}",
                parts.scheme
            )));
        }
        if !context.remaining().is_empty() {
            return Err(ChannelError::configuration(format!(
                "{} transport must be the last binding element",
                parts.scheme
            )));
        }
        parts.settings.validate()?;
        let encoder = context
            .parameters()
            .get::<EncoderParameter>()
            .map(|parameter| Arc::clone(&parameter.0))
            .unwrap_or_else(|| Arc::new(BinaryMessageEncoder));
        let upgrade = context
            .parameters()
            .get::<UpgradeParameter>()
            .map(|parameter| parameter.0.clone());
        let buffers = byte_buffer_pool(parts.settings.connection_buffer_size, MAX_IDLE_BUFFERS);

        let factory = Arc::new(Self {
            core: LifecycleCore::new(format!("{} channel factory", parts.scheme)),
            shared: Arc::new(FactoryShared {
                scheme: parts.scheme,
                connector: parts.connector,
                resolver: parts.resolver,
                registry: parts.registry,
                settings: parts.settings,
                timeouts: context.timeouts(),
                declared: context.declared(),
                encoder,
                upgrade,
                buffers,
                pool: Mutex::new(None),
                tracker: ChannelTracker::new(),
            }),
        });
        debug!(
            transport = factory.shared.scheme,
            content_type = %factory.shared.encoder.content_type(),
            upgrade = factory.shared.upgrade.as_ref().map(StreamUpgradeProvider::token),
            "transport channel factory built"
        );
        Ok(factory)
    }

    /// 当前持有的连接池，工厂打开前为 `None`。
    pub fn connection_pool(&self) -> Option<Arc<ConnectionPool>> {
        self.shared.pool.lock().clone()
    }

    fn release_buffers(&self) {
        self.shared.buffers.close();
    }
}

#[async_trait]
impl LifecycleHooks for TransportChannelFactory {
    async fn on_open(&self, _deadline: Deadline) -> Result<()> {
        let pool = self
            .shared
            .registry
            .lookup(&self.shared.settings.pool, Arc::clone(&self.shared.resolver))?;
        *self.shared.pool.lock() = Some(pool);
        Ok(())
    }

    async fn on_close(&self, deadline: Deadline) -> Result<()> {
        let channels = self.shared.tracker.close();
        let report = close_all(&channels, deadline).await;
        let pool = self.shared.pool.lock().take();
        let released = match pool {
            Some(pool) => self.shared.registry.release(&pool, deadline).await,
            None => Ok(()),
        };
        self.release_buffers();
        report.into_result()?;
        released
    }

    fn on_abort(&self) {
        for channel in self.shared.tracker.close() {
            channel.abort();
        }
        if let Some(pool) = self.shared.pool.lock().take() {
            self.shared.registry.abort_release(&pool);
        }
        self.release_buffers();
    }
}

impl ManagedCommunicationObject for TransportChannelFactory {
    fn lifecycle(&self) -> &LifecycleCore {
        &self.core
    }

    fn default_timeouts(&self) -> ChannelTimeouts {
        self.shared.timeouts
    }
}

impl ChannelFactory for TransportChannelFactory {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Request
    }

    fn create_channel_with(
        &self,
        address: EndpointAddress,
        timeouts: Option<ChannelTimeouts>,
    ) -> Result<Arc<dyn Channel>> {
        self.core.ensure_opened("create channels")?;
        if address.scheme() != self.shared.scheme {
            return Err(ChannelError::configuration(format!(
                "address `{address}` does not use the `{}` scheme",
                self.shared.scheme
            )));
        }
        let pool = self
            .connection_pool()
            .ok_or_else(|| ChannelError::invalid_state("transport factory holds no connection pool"))?;
        let slot = self.shared.tracker.reserve();
        let channel = Arc::new(TransportChannel {
            core: LifecycleCore::new(format!("{} channel to {address}", self.shared.scheme)),
            shared: Arc::clone(&self.shared),
            pool,
            address,
            timeouts: timeouts.unwrap_or(self.shared.timeouts),
            remote_security: Mutex::new(None),
            in_flight: InFlight::new(),
            slot,
        });
        self.shared
            .tracker
            .track(&channel.slot, Arc::clone(&channel) as Arc<dyn Channel>)?;
        Ok(channel)
    }

    /// 先按声明顺序询问绑定元素，首个答案胜出；元素都不回答时再给出运行时视图。
    fn get_property(&self, type_id: TypeId) -> Option<Property> {
        if let Some(declared) = self.shared.declared.get_inner_property(type_id) {
            return Some(declared);
        }
        if type_id == TypeId::of::<MessageEncoding>() {
            return Some(Arc::new(MessageEncoding {
                content_type: self.shared.encoder.content_type().to_owned(),
            }));
        }
        if type_id == TypeId::of::<ChannelTimeouts>() {
            return Some(Arc::new(self.shared.timeouts));
        }
        if type_id == TypeId::of::<crate::stream::upgrade::SecurityCapabilities>() {
            return self
                .shared
                .upgrade
                .as_ref()
                .map(|upgrade| Arc::new(upgrade.capabilities()) as Property);
        }
        transport_property(self.shared.scheme, &self.shared.settings, type_id)
    }
}

impl fmt::Debug for TransportChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannelFactory")
            .field("core", &self.core)
            .field("scheme", &self.shared.scheme)
            .field("channels", &self.shared.tracker.len())
            .finish()
    }
}

/// 在途请求计数。
struct InFlight(watch::Sender<usize>);

impl InFlight {
    fn new() -> Self {
        Self(watch::Sender::new(0))
    }

    fn enter(&self) -> InFlightGuard<'_> {
        self.0.send_modify(|count| *count += 1);
        InFlightGuard(&self.0)
    }

    fn count(&self) -> usize {
        *self.0.borrow()
    }

    async fn drained(&self) {
        let mut receiver = self.0.subscribe();
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

struct InFlightGuard<'a>(&'a watch::Sender<usize>);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// 请求-应答传输通道。
pub struct TransportChannel {
    core: LifecycleCore,
    shared: Arc<FactoryShared>,
    pool: Arc<ConnectionPool>,
    address: EndpointAddress,
    timeouts: ChannelTimeouts,
    remote_security: Mutex<Option<RemoteSecurity>>,
    in_flight: InFlight,
    slot: TrackedSlot,
}

impl TransportChannel {
    /// 最近一次升级握手得到的远端身份。
    pub fn remote_security(&self) -> Option<RemoteSecurity> {
        self.remote_security.lock().clone()
    }

    async fn exchange(&self, message: Message, deadline: Deadline) -> Result<Message> {
        let payload = self.shared.encoder.encode(&message)?;
        let mut connection = self
            .pool
            .take(&self.address, self.shared.connector.as_ref(), deadline)
            .await?;
        if !connection.is_prepared() {
            connection = self.prepare(connection, deadline).await?;
        }
        if let Some(security) = connection.remote_security() {
            *self.remote_security.lock() = Some(security.clone());
        }

        match self.round_trip(&mut connection, &payload, deadline).await {
            Ok(reply) => {
                self.pool.return_connection(connection);
                self.shared.encoder.decode(&reply)
            }
            Err(err) => {
                debug!(channel = %self.core.label(), error = %err, "discarding connection after failed exchange");
                Err(err)
            }
        }
    }

    /// 新连接上执行会话前导与可选升级。
    async fn prepare(&self, connection: PooledConnection, deadline: Deadline) -> Result<PooledConnection> {
        let (stream, mut lease) = connection.into_parts();
        let preamble = ClientPreamble {
            via: self.address.via().as_str(),
            content_type: self.shared.encoder.content_type(),
        };
        let (stream, security) =
            establish_client_session(stream, preamble, self.shared.upgrade.as_ref(), deadline).await?;
        lease.mark_prepared(security);
        Ok(lease.attach(stream))
    }

    async fn round_trip(
        &self,
        connection: &mut PooledConnection,
        payload: &[u8],
        deadline: Deadline,
    ) -> Result<Bytes> {
        let settings = &self.shared.settings;
        let mut stream = TimeoutStream::new(
            MaxMessageSizeStream::new(
                connection.stream_mut(),
                settings.max_received_message_size + ENVELOPE_HEADER_LEN,
                settings.max_buffer_size as u64 + ENVELOPE_HEADER_LEN,
            ),
            deadline,
        );
        write_envelope(&mut stream, payload).await?;

        let mut scratch = self.shared.buffers.take();
        let incoming = read_incoming(&mut stream, settings.max_received_message_size, &mut scratch).await;
        self.shared.buffers.return_item(scratch);
        match incoming? {
            Some(Incoming::Envelope(reply)) => Ok(reply),
            Some(Incoming::Fault(reason)) => Err(ChannelError::communication(format!(
                "service reported fault: {reason}"
            ))),
            Some(Incoming::End) | None => Err(ChannelError::communication(
                "connection closed before a reply arrived",
            )),
        }
    }
}

#[async_trait]
impl LifecycleHooks for TransportChannel {
    /// 等待在途请求完成；截止时间到达时由状态机中止通道，剩余请求以 `Aborted` 结束。
    async fn on_close(&self, _deadline: Deadline) -> Result<()> {
        let pending = self.in_flight.count();
        if pending > 0 {
            debug!(channel = %self.core.label(), pending, "waiting for in-flight requests before closing");
            self.in_flight.drained().await;
        }
        self.slot.release();
        Ok(())
    }

    fn on_abort(&self) {
        self.slot.release();
    }
}

impl ManagedCommunicationObject for TransportChannel {
    fn lifecycle(&self) -> &LifecycleCore {
        &self.core
    }

    fn default_timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }
}

#[async_trait]
impl Channel for TransportChannel {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Request
    }

    fn remote_address(&self) -> &EndpointAddress {
        &self.address
    }

    async fn request(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        self.core.ensure_opened("send requests")?;
        let _in_flight = self.in_flight.enter();
        let deadline = deadline_or(timeout, self.timeouts.send);
        let result = tokio::select! {
            biased;
            () = self.core.closed() => Err(ChannelError::aborted(format!(
                "{} was closed while a request was in flight",
                self.core.label()
            ))),
            result = self.exchange(message, deadline) => result,
        };
        if let Err(err) = &result
            && matches!(err.category(), ErrorCategory::ProtocolViolation | ErrorCategory::Fatal)
        {
            warn!(channel = %self.core.label(), error = %err, "request failed fatally, faulting channel");
            self.core.fault();
        }
        result
    }

    fn get_property(&self, type_id: TypeId) -> Option<Property> {
        if type_id == TypeId::of::<RemoteSecurity>() {
            return self.remote_security().map(|security| Arc::new(security) as Property);
        }
        if type_id == TypeId::of::<ChannelTimeouts>() {
            return Some(Arc::new(self.timeouts));
        }
        None
    }
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("core", &self.core)
            .field("address", &self.address)
            .finish()
    }
}
