use std::{any::TypeId, sync::Arc};

use spark_channel::{
    ChannelFactory, ChannelShape, Result,
    binding::{BindingContext, BindingElement, ElementKind, Property},
    channel::{TransportChannelFactory, TransportFactoryParts, transport_property},
    pool::ConnectionPoolRegistry,
};

use crate::{
    config::{TcpSocketConfig, TcpTransportConfig},
    connector::TcpConnector,
    resolver::TcpEndpointKeyResolver,
};

/// `net.tcp` 地址方案。
pub const SCHEME: &str = "net.tcp";

/// TCP 传输绑定元素，必须位于绑定序列末尾。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 TCP 介质相关的三件事（端点键规范化、建连、套接字选项）交给通用传输工厂，
///   请求-应答语义、会话前导与连接池复用全部由 `spark-channel` 提供；
/// - 克隆出的元素共享同一个连接池注册表，因此由它们构建的多个工厂可以共享连接。
///
/// ## 契约（What）
/// - 只构建 [`ChannelShape::Request`] 形态的工厂；
/// - 公布 `TransportScheme`、`TransportSettings`、`ConnectionPoolSettings` 与 [`TcpSocketConfig`]。
#[derive(Clone, Debug)]
pub struct TcpTransportBindingElement {
    config: TcpTransportConfig,
    registry: Arc<ConnectionPoolRegistry>,
}

impl Default for TcpTransportBindingElement {
    fn default() -> Self {
        Self::new(TcpTransportConfig::default())
    }
}

impl TcpTransportBindingElement {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ConnectionPoolRegistry::new(SCHEME)),
        }
    }

    /// 与其他元素共享连接池注册表。
    pub fn with_registry(mut self, registry: Arc<ConnectionPoolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionPoolRegistry> {
        &self.registry
    }
}

impl BindingElement for TcpTransportBindingElement {
    fn kind(&self) -> ElementKind {
        ElementKind::Transport
    }

    fn can_build_channel_factory(&self, context: &BindingContext, shape: ChannelShape) -> bool {
        shape == ChannelShape::Request && context.remaining().is_empty() && self.config.validate().is_ok()
    }

    fn build_channel_factory(&self, context: BindingContext, shape: ChannelShape) -> Result<Arc<dyn ChannelFactory>> {
        self.config.validate()?;
        TransportChannelFactory::build(
            context,
            shape,
            TransportFactoryParts {
                scheme: SCHEME,
                connector: Arc::new(TcpConnector::new(self.config.socket)),
                resolver: Arc::new(TcpEndpointKeyResolver),
                registry: Arc::clone(&self.registry),
                settings: self.config.settings.clone(),
            },
        )
    }

    fn get_property(&self, _context: &BindingContext, type_id: TypeId) -> Option<Property> {
        if type_id == TypeId::of::<TcpSocketConfig>() {
            return Some(Arc::new(self.config.socket));
        }
        transport_property(SCHEME, &self.config.settings, type_id)
    }
}
