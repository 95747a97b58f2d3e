//! 连接池：注册表 → 连接池 → 端点池三级结构。
//!
//! # 模块定位（Why）
//! - 传输连接（TCP 套接字、命名管道）的建立代价远高于一次消息交换；连接池让同一进程内
//!   指向同一端点的多个通道复用连接，同时以容量、空闲超时与租约超时约束资源占用。
//!
//! # 核心组成（What）
//! - [`ConnectionPoolRegistry`]：分组键到兼容连接池列表的映射，负责引用计数与摘除；
//! - [`ConnectionPool`]：一组设置下的连接池，按 [`EndpointKey`] 分桶；
//! - [`EndpointConnectionPool`]：单端点的容量受限空闲队列；
//! - [`Connector`] / [`EndpointKeyResolver`]：由传输实现的建连与端点键推导能力。
//!
//! # 风险提示（Trade-offs）
//! - 过期连接只在借还时惰性淘汰，不启动后台清扫任务。

mod connection_pool;
mod connector;
mod endpoint;
mod registry;
mod settings;

pub use connection_pool::ConnectionPool;
pub use connector::{Connector, EndpointKey, EndpointKeyResolver};
pub use endpoint::{ConnectionLease, EndpointConnectionPool, EndpointPoolStats, PooledConnection};
pub use registry::{CompatibilityPredicate, ConnectionPoolRegistry};
pub use settings::{ConnectionPoolSettings, OverflowPolicy};
