use async_trait::async_trait;
use spark_channel::{
    Deadline, EndpointAddress, Result,
    pool::{EndpointKey, EndpointKeyResolver},
};

use crate::error::invalid_address;

/// `net.tcp` 地址未写端口时使用的默认端口。
pub const DEFAULT_PORT: u16 = 808;

/// 以“小写主机名 + 端口”作为端点键。
///
/// 主机名大小写不同、端口省略与显式写出默认端口的地址都落在同一个端点桶中。
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpEndpointKeyResolver;

impl TcpEndpointKeyResolver {
    /// 同步计算端点键。
    pub fn endpoint_key(address: &EndpointAddress) -> Result<EndpointKey> {
        let host = address.host();
        if host.is_empty() {
            return Err(invalid_address(format!("address `{address}` has no host")));
        }
        let port = address.port().unwrap_or(DEFAULT_PORT);
        Ok(EndpointKey::new(format!("{host}:{port}")))
    }
}

#[async_trait]
impl EndpointKeyResolver for TcpEndpointKeyResolver {
    async fn resolve(&self, address: &EndpointAddress, _deadline: Deadline) -> Result<EndpointKey> {
        Self::endpoint_key(address)
    }
}
