use async_trait::async_trait;
use spark_channel::{
    Deadline, EndpointAddress, Result,
    pool::{Connector, EndpointKey},
    stream::BoxedStream,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{
    config::TcpSocketConfig,
    error::{CONFIGURE, CONNECT, map_io_error},
    resolver::DEFAULT_PORT,
    util::run_with_deadline,
};

/// 以 tokio `TcpStream` 建立原始连接，并在交给连接池前应用套接字选项。
///
/// # 契约（What）
/// - 建连受截止时间约束，超时返回 `spark.transport.tcp.timeout`；
/// - 对端拒绝或地址不可达映射为 `EndpointNotFound`，连接池据此清理端点；
/// - 套接字选项设置失败时连接被丢弃并返回 `spark.transport.tcp.configure_failed`。
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    socket: TcpSocketConfig,
}

impl TcpConnector {
    pub fn new(socket: TcpSocketConfig) -> Self {
        Self { socket }
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.socket
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, key: &EndpointKey, address: &EndpointAddress, deadline: Deadline) -> Result<BoxedStream> {
        let host = address.host();
        // IPv6 字面量在 URL 中带方括号
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = address.port().unwrap_or(DEFAULT_PORT);

        let stream = run_with_deadline(deadline, CONNECT, TcpStream::connect((host, port))).await?;
        self.socket
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        debug!(
            endpoint = %key,
            peer = ?stream.peer_addr().ok(),
            nodelay = self.socket.nodelay,
            "tcp connection established"
        );
        Ok(Box::new(stream))
    }
}
