//! 集成测试共用的进程内传输：`tokio::io::duplex` 连接 + 服务端会话。

#![allow(dead_code)]

use std::{
    any::TypeId,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use spark_channel::{
    EndpointAddress, Message, Result,
    binding::{BindingContext, BindingElement, ElementKind, Property},
    channel::{ChannelFactory, ChannelShape, TransportChannelFactory, TransportFactoryParts, transport_property},
    config::TransportSettings,
    encoding::{BinaryMessageEncoder, MessageEncoder},
    framing::{ServerSession, ServerSessionOptions},
    pool::{ConnectionPoolRegistry, Connector, EndpointKey, EndpointKeyResolver},
    stream::{BoxedStream, upgrade::StreamUpgradeProvider},
    time::Deadline,
};

pub const SCHEME: &str = "mem";

/// 服务端对单个信封的处理结果。
pub enum Reply {
    Payload(Bytes),
    Fault(String),
    /// 不应答并关闭连接。
    Close,
    /// 永不应答。
    Hang,
    /// 延迟后应答。
    Delayed(Duration, Bytes),
}

pub type Handler = Arc<dyn Fn(Bytes) -> Reply + Send + Sync>;

/// 按动作分派的标准服务：
/// - `notify`：空确认；
/// - `garbage`：不可解码的应答；
/// - `fault`：Fault 记录；
/// - `hang`：永不应答；
/// - `big`：应答体长度为请求体中的十进制数字；
/// - `slow`：延迟请求体中的毫秒数后回显；
/// - 其余动作原样回显。
pub fn standard_service(encoder: Arc<dyn MessageEncoder>) -> Handler {
    Arc::new(move |payload: Bytes| {
        let request = match encoder.decode(&payload) {
            Ok(request) => request,
            Err(err) => return Reply::Fault(err.to_string()),
        };
        match request.action() {
            "notify" => Reply::Payload(encoder.encode(&Message::empty()).expect("空消息可编码")),
            "garbage" => Reply::Payload(Bytes::from_static(&[0xff])),
            "fault" => Reply::Fault("rejected by service".to_owned()),
            "hang" => Reply::Hang,
            "close" => Reply::Close,
            "slow" => {
                let millis: u64 = std::str::from_utf8(request.body())
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .unwrap_or(0);
                Reply::Delayed(Duration::from_millis(millis), payload)
            }
            "big" => {
                let len: usize = std::str::from_utf8(request.body())
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .unwrap_or(0);
                Reply::Payload(
                    encoder
                        .encode(&Message::new("big", vec![b'x'; len]))
                        .expect("大消息可编码"),
                )
            }
            _ => Reply::Payload(payload),
        }
    })
}

/// 每次建连都启动一个服务端会话任务的连接器。
#[derive(Clone)]
pub struct MemoryConnector {
    options: ServerSessionOptions,
    handler: Handler,
    connections: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("connections", &self.connections())
            .finish()
    }
}

impl MemoryConnector {
    pub fn new(encoder: Arc<dyn MessageEncoder>, upgrade: Option<StreamUpgradeProvider>) -> Self {
        Self {
            options: ServerSessionOptions {
                content_type: encoder.content_type().to_owned(),
                upgrade,
                max_received_message_size: 1024 * 1024,
            },
            handler: standard_service(encoder),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn binary() -> Self {
        Self::new(Arc::new(BinaryMessageEncoder), None)
    }

    /// 已建立的连接总数。
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(stream: BoxedStream, options: ServerSessionOptions, handler: Handler) {
    let Ok(mut session) = ServerSession::accept(stream, &options, Deadline::after(Duration::from_secs(10))).await else {
        return;
    };
    while let Ok(Some(payload)) = session.read_envelope().await {
        let written = match handler(payload) {
            Reply::Payload(reply) => session.write_envelope(&reply).await,
            Reply::Fault(reason) => session.write_fault(&reason).await,
            Reply::Close => return,
            Reply::Hang => std::future::pending::<Result<()>>().await,
            Reply::Delayed(delay, reply) => {
                tokio::time::sleep(delay).await;
                session.write_envelope(&reply).await
            }
        };
        if written.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _key: &EndpointKey, _address: &EndpointAddress, _deadline: Deadline) -> Result<BoxedStream> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve(Box::new(server), self.options.clone(), Arc::clone(&self.handler)));
        Ok(Box::new(client))
    }
}

/// 以 `host:port` 作为端点键。
#[derive(Debug, Default)]
pub struct MemoryResolver;

#[async_trait]
impl EndpointKeyResolver for MemoryResolver {
    async fn resolve(&self, address: &EndpointAddress, _deadline: Deadline) -> Result<EndpointKey> {
        Ok(EndpointKey::new(format!(
            "{}:{}",
            address.host(),
            address.port().unwrap_or(0)
        )))
    }
}

/// 进程内传输元素。
#[derive(Debug, Clone)]
pub struct MemoryTransportBindingElement {
    pub connector: MemoryConnector,
    pub registry: Arc<ConnectionPoolRegistry>,
    pub settings: TransportSettings,
}

impl MemoryTransportBindingElement {
    pub fn new(connector: MemoryConnector) -> Self {
        Self {
            connector,
            registry: Arc::new(ConnectionPoolRegistry::new(SCHEME)),
            settings: TransportSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl BindingElement for MemoryTransportBindingElement {
    fn kind(&self) -> ElementKind {
        ElementKind::Transport
    }

    fn can_build_channel_factory(&self, context: &BindingContext, shape: ChannelShape) -> bool {
        shape == ChannelShape::Request && context.remaining().is_empty()
    }

    fn build_channel_factory(&self, context: BindingContext, shape: ChannelShape) -> Result<Arc<dyn ChannelFactory>> {
        TransportChannelFactory::build(
            context,
            shape,
            TransportFactoryParts {
                scheme: SCHEME,
                connector: Arc::new(self.connector.clone()),
                resolver: Arc::new(MemoryResolver),
                registry: Arc::clone(&self.registry),
                settings: self.settings.clone(),
            },
        )
    }

    fn get_property(&self, _context: &BindingContext, type_id: TypeId) -> Option<Property> {
        transport_property(SCHEME, &self.settings, type_id)
    }
}

pub fn address(path: &str) -> EndpointAddress {
    EndpointAddress::parse(&format!("{SCHEME}://service:9000/{path}")).expect("测试地址合法")
}

pub fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}
