#![doc = r#"
`spark-transport-tcp` 为 `spark-channel` 提供 `net.tcp` 传输。

# 模块定位（Why）
- 通道栈的请求-应答语义、会话分帧与连接池都与介质无关；本 crate 只补齐 TCP 特有的部分：
  端点键规范化、受截止时间约束的建连，以及 `TCP_NODELAY` / `SO_LINGER` 套接字选项。

# 组成（What）
- [`TcpTransportBindingElement`]：绑定序列末尾的传输元素；
- [`TcpConnector`]：tokio 建连 + [`TcpSocketConfig`]；
- [`TcpEndpointKeyResolver`]：`小写主机名:端口`，端口缺省为 [`DEFAULT_PORT`]；
- [`TcpTransportConfig`]：serde/TOML 配置。

# 错误码
IO 错误映射为 `spark.transport.tcp.*` 错误码：连接被拒绝、地址不可达归类为 `EndpointNotFound`，
超时归类为 `Timeout`，其余为 `Communication`。
"#]

mod config;
mod connector;
mod element;
mod error;
mod resolver;
mod util;

pub use config::{TcpSocketConfig, TcpTransportConfig};
pub use connector::TcpConnector;
pub use element::{SCHEME, TcpTransportBindingElement};
pub use resolver::{DEFAULT_PORT, TcpEndpointKeyResolver};
