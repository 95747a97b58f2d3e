#![doc = r#"
`spark-transport-pipe` 为 `spark-channel` 提供 `net.pipe` 本机传输。

# 模块定位（Why）
- 同机进程间通信不需要经过 TCP 协议栈；本 crate 以 Unix 域套接字承载命名管道语义；
- 管道的物理名字由服务端在启动时发布，可能随服务重启而变化，客户端按目标 URI
  解析并缓存，发现名字过期时由连接池触发精确清理后重新解析。

# 组成（What）
- [`PipeTransportBindingElement`]：传输元素，注册表使用 [`pool_compatible`] 忽略租约超时；
- [`PipeNameResolver`] + [`PipeNameSource`] / [`DirectoryPipeNameSource`]：管道名解析；
- [`PipeConnector`]：Unix 域套接字建连，非 Unix 平台返回 `Unsupported`；
- [`PipeTransportConfig`]：serde/TOML 配置。
"#]

mod config;
mod connector;
mod element;
mod error;
mod name;
mod util;

pub use config::PipeTransportConfig;
pub use connector::PipeConnector;
pub use element::{PipeTransportBindingElement, SCHEME, pool_compatible};
pub use name::{DirectoryPipeNameSource, PipeNameResolver, PipeNameSource};
