use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::SockRef;
use spark_channel::{ChannelError, Result, TransportSettings};
use tokio::net::TcpStream;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 池化连接会被长期复用，关闭策略（`SO_LINGER`）与小包延迟（`TCP_NODELAY`）
///   直接影响请求-应答往返时延与连接回收时序，因此以配置项显式声明；
/// - 调用方无需直接操作 `socket2` 或平台相关常量。
///
/// ## 核心逻辑（How）
/// - `linger_ms` 为 `Some(ms)` 时通过 `socket2::SockRef::set_linger` 设置 `SO_LINGER`，
///   关闭阶段在超时后未完成即发送 RST；缺省遵循内核默认策略；
/// - `nodelay` 缺省开启：请求与应答都是完整的小帧，Nagle 合并只会增加延迟。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒），过小的值可能丢弃仍在发送缓冲区的数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    pub linger_ms: Option<u64>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger_ms: None,
        }
    }
}

impl TcpSocketConfig {
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|value| u64::try_from(value.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    /// 把配置落到已建立的连接上。
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger())
    }
}

/// TCP 传输的完整配置：通用传输设置加套接字选项。
///
/// ```toml
/// [settings]
/// max_received_message_size = 1048576
/// max_buffer_size = 1048576
///
/// [settings.pool]
/// group_name = "orders"
///
/// [socket]
/// nodelay = true
/// linger_ms = 1000
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpTransportConfig {
    pub settings: TransportSettings,
    pub socket: TcpSocketConfig,
}

impl TcpTransportConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|err| {
            ChannelError::configuration(format!("invalid tcp transport configuration: {}", err.message()))
                .with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_settings_and_socket_tables() {
        let config = TcpTransportConfig::from_toml_str(
            r#"
            [settings]
            max_received_message_size = 1048576

            [settings.pool]
            group_name = "orders"
            max_outbound_connections_per_endpoint = 4

            [socket]
            nodelay = false
            linger_ms = 1500
            "#,
        )
        .expect("配置合法");
        assert_eq!(config.settings.max_received_message_size, 1_048_576);
        assert_eq!(config.settings.pool.group_name, "orders");
        assert!(!config.socket.nodelay);
        assert_eq!(config.socket.linger(), Some(Duration::from_millis(1500)));

        let defaults = TcpTransportConfig::from_toml_str("").expect("空文档取默认值");
        assert!(defaults.socket.nodelay);
        assert_eq!(defaults.socket.linger(), None);
    }

    #[test]
    fn rejects_invalid_transport_settings() {
        let err = TcpTransportConfig::from_toml_str("[settings]\nmax_buffer_size = 0\n").expect_err("零缓冲非法");
        assert_eq!(err.code(), spark_channel::error::codes::CONFIGURATION);
    }

    #[tokio::test]
    async fn apply_sets_socket_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定本地端口");
        let addr = listener.local_addr().expect("读取监听地址");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.expect("建立连接");
        let _server = accepted.expect("接受连接");

        let config = TcpSocketConfig::default().with_linger(Some(Duration::from_secs(1)));
        config.apply(&client).expect("设置套接字选项");
        assert!(client.nodelay().expect("读取 TCP_NODELAY"));
        assert_eq!(
            SockRef::from(&client).linger().expect("读取 SO_LINGER"),
            Some(Duration::from_secs(1))
        );
    }
}
