use std::{any::TypeId, sync::Arc};

use spark_channel::{
    ChannelFactory, ChannelShape, Result,
    binding::{BindingContext, BindingElement, ElementKind, Property},
    channel::{TransportChannelFactory, TransportFactoryParts, transport_property},
    pool::{ConnectionPoolRegistry, ConnectionPoolSettings},
};

use crate::{
    config::PipeTransportConfig,
    connector::PipeConnector,
    name::{DirectoryPipeNameSource, PipeNameResolver, PipeNameSource},
};

/// `net.pipe` 地址方案。
pub const SCHEME: &str = "net.pipe";

/// 管道连接池的兼容规则：除租约超时外其余设置必须一致。
///
/// 本机连接不需要靠租约轮换来重新均衡负载，租约超时不同的工厂可以共享连接。
pub fn pool_compatible(existing: &ConnectionPoolSettings, requested: &ConnectionPoolSettings) -> bool {
    requested.clone().with_lease_timeout(existing.lease_timeout) == *existing
}

/// 命名管道传输绑定元素。
///
/// 克隆出的元素共享管道名解析缓存与连接池注册表。
#[derive(Clone, Debug)]
pub struct PipeTransportBindingElement {
    config: PipeTransportConfig,
    resolver: Arc<PipeNameResolver>,
    registry: Arc<ConnectionPoolRegistry>,
}

impl Default for PipeTransportBindingElement {
    fn default() -> Self {
        Self::new(PipeTransportConfig::default())
    }
}

impl PipeTransportBindingElement {
    /// 以配置中的发布目录作为管道名来源。
    pub fn new(config: PipeTransportConfig) -> Self {
        let source = Arc::new(DirectoryPipeNameSource::new(config.publication_dir.clone()));
        Self::with_source(config, source)
    }

    pub fn with_source(config: PipeTransportConfig, source: Arc<dyn PipeNameSource>) -> Self {
        Self {
            config,
            resolver: Arc::new(PipeNameResolver::new(source)),
            registry: Arc::new(ConnectionPoolRegistry::with_compatibility(SCHEME, pool_compatible)),
        }
    }

    pub fn config(&self) -> &PipeTransportConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<PipeNameResolver> {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<ConnectionPoolRegistry> {
        &self.registry
    }
}

impl BindingElement for PipeTransportBindingElement {
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
                connector: Arc::new(PipeConnector),
                resolver: Arc::clone(&self.resolver) as _,
                registry: Arc::clone(&self.registry),
                settings: self.config.settings.clone(),
            },
        )
    }

    fn get_property(&self, _context: &BindingContext, type_id: TypeId) -> Option<Property> {
        transport_property(SCHEME, &self.config.settings, type_id)
    }
}
