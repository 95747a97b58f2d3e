#![doc = r#"
`spark-channel` 提供面向连接的客户端通道栈。

# 模块定位（Why）
- 把一个声明式、有序的绑定元素序列（传输、编码、升级、单向适配）装配为可运行的通道工厂；
- 以按端点分桶、容量受限、惰性淘汰的连接池复用昂贵的传输连接；
- 在原始连接之上叠加配额、超时、EOF 检测与升级握手等流装饰器；
- 以共享截止时间的散射-聚合批量打开/关闭大量通信对象，并正确统计部分失败。

# 设计概要（How）
- 叶到根依赖顺序：`buffer` → `stream` → `pool` → `binding` → `channel` → `lifecycle::open_all/close_all`；
- 具体介质（TCP、命名管道）位于独立的传输 crate，仅需实现 [`pool::Connector`]、
  [`pool::EndpointKeyResolver`] 与一个传输 [`binding::BindingElement`]；
- 所有异步接口使用原生 `Future`，截止时间以 [`Deadline`] 传递并在每次调用时重新计算剩余预算。

# 环境约束（What）
- 库本身不安装任何 `tracing` 订阅者，也不派生后台任务；
- 连接池注册表按传输显式构造并共享，不存在进程级隐式全局状态。
"#]

pub mod address;
pub mod binding;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod encoding;
pub mod error;
pub mod framing;
pub mod lifecycle;
pub mod message;
pub mod pool;
pub mod stream;
pub mod time;

pub use address::EndpointAddress;
pub use binding::{BindingElement, ChannelBuilder, CustomBinding};
pub use channel::{Channel, ChannelFactory, ChannelShape};
pub use config::{BindingConfig, ChannelTimeouts, TransportSettings};
pub use error::{ChannelError, ErrorCategory, Result};
pub use lifecycle::{CommunicationObject, CommunicationState, close_all, open_all};
pub use message::Message;
pub use time::Deadline;
