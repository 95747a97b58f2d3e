use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{address::EndpointAddress, error::Result, stream::BoxedStream, time::Deadline};

/// 端点池键：传输相关的规范化端点标识。
///
/// TCP 取小写主机名与端口，命名管道取解析后的管道名。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(Arc<str>);

impl EndpointKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointKey").field(&&*self.0).finish()
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 从目标地址推导端点池键。
///
/// # 契约（What）
/// - `resolve`：可能涉及 IO（如读取发布的管道名），必须遵守截止时间；
/// - `purge`：端点身份失效时由连接池调用，只清理该地址的缓存项，不影响其它端点。
#[async_trait]
pub trait EndpointKeyResolver: Send + Sync + fmt::Debug + 'static {
    async fn resolve(&self, address: &EndpointAddress, deadline: Deadline) -> Result<EndpointKey>;

    fn purge(&self, _address: &EndpointAddress) {}
}

/// 建立原始连接的能力接口，由传输 crate 实现。
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(
        &self,
        key: &EndpointKey,
        address: &EndpointAddress,
        deadline: Deadline,
    ) -> Result<BoxedStream>;
}
