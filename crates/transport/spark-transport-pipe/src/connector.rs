use async_trait::async_trait;
use spark_channel::{
    Deadline, EndpointAddress, Result,
    pool::{Connector, EndpointKey},
    stream::BoxedStream,
};

/// 以 Unix 域套接字连接已解析的管道名；端点键即套接字路径。
///
/// 套接字文件不存在或无人监听时返回 `EndpointNotFound`，连接池据此清理该 URI 的管道名缓存。
#[derive(Clone, Copy, Debug, Default)]
pub struct PipeConnector;

#[cfg(unix)]
#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, key: &EndpointKey, address: &EndpointAddress, deadline: Deadline) -> Result<BoxedStream> {
        use crate::{error::CONNECT, util::run_with_deadline};

        let stream = run_with_deadline(deadline, CONNECT, tokio::net::UnixStream::connect(key.as_str())).await?;
        tracing::debug!(endpoint = %address, socket = %key, "pipe connection established");
        Ok(Box::new(stream))
    }
}

#[cfg(not(unix))]
#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, _key: &EndpointKey, address: &EndpointAddress, _deadline: Deadline) -> Result<BoxedStream> {
        Err(spark_channel::ChannelError::unsupported(format!(
            "pipe transport to `{address}` requires unix domain sockets"
        )))
    }
}
