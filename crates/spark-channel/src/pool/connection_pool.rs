use std::{collections::HashMap, fmt, sync::Arc};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    address::EndpointAddress,
    error::{ChannelError, ErrorCategory, Result},
    pool::{
        connector::{Connector, EndpointKey, EndpointKeyResolver},
        endpoint::{EndpointConnectionPool, EndpointPoolStats, PooledConnection},
        settings::ConnectionPoolSettings,
    },
    time::Deadline,
};

/// 引用计数状态，与端点表共用同一把粗粒度锁。
struct PoolState {
    refs: usize,
    closed: bool,
    endpoints: HashMap<EndpointKey, Arc<EndpointConnectionPool>>,
}

/// 一组兼容设置下的连接池，按端点键分桶。
///
/// # 契约（What）
/// - 由 [`ConnectionPoolRegistry`](super::ConnectionPoolRegistry) 创建与回收，
///   `try_open` / `close_ref` 维护引用计数，计数归零即关闭；
/// - `take`：解析端点键后从对应端点池借出连接；端点身份失效（`EndpointNotFound`）时
///   清理该地址的解析缓存与对应端点池，其它端点不受影响；
/// - `return_connection`：连接回到所属端点池，池已关闭时直接丢弃；
/// - `drain`：关闭全部端点池并在截止时间内优雅关闭空闲连接。
pub struct ConnectionPool {
    settings: Arc<ConnectionPoolSettings>,
    resolver: Arc<dyn EndpointKeyResolver>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub(crate) fn new(
        settings: ConnectionPoolSettings,
        resolver: Arc<dyn EndpointKeyResolver>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            resolver,
            state: Mutex::new(PoolState {
                refs: 1,
                closed: false,
                endpoints: HashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.group_name
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().refs
    }

    /// 增加一次引用；池已关闭时返回 `false`。
    pub(crate) fn try_open(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.refs += 1;
        true
    }

    /// 释放一次引用；返回 `true` 表示这是最后一个引用且池已被标记关闭。
    pub(crate) fn close_ref(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            state.closed = true;
            return true;
        }
        false
    }

    fn endpoint(&self, key: &EndpointKey) -> Result<Arc<EndpointConnectionPool>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::aborted(format!(
                "connection pool `{}` is closed",
                self.settings.group_name
            )));
        }
        Ok(Arc::clone(state.endpoints.entry(key.clone()).or_insert_with(|| {
            debug!(pool.group = %self.settings.group_name, endpoint = %key, "created endpoint pool");
            Arc::new(EndpointConnectionPool::new(
                key.clone(),
                Arc::clone(&self.settings),
            ))
        })))
    }

    /// 借出一条到 `address` 的连接。
    pub async fn take(
        &self,
        address: &EndpointAddress,
        connector: &dyn Connector,
        deadline: Deadline,
    ) -> Result<PooledConnection> {
        let key = deadline
            .run("endpoint resolution", self.resolver.resolve(address, deadline))
            .await
            .inspect_err(|err| self.on_endpoint_failure(address, None, err))?;
        let endpoint = self.endpoint(&key)?;
        endpoint
            .acquire(address, connector, deadline)
            .await
            .inspect_err(|err| self.on_endpoint_failure(address, Some(&key), err))
    }

    fn on_endpoint_failure(
        &self,
        address: &EndpointAddress,
        key: Option<&EndpointKey>,
        error: &ChannelError,
    ) {
        if error.category() != &ErrorCategory::EndpointNotFound {
            return;
        }
        self.resolver.purge(address);
        let stale = key.and_then(|key| self.state.lock().endpoints.remove(key));
        if let Some(stale) = stale {
            drop(stale.close());
        }
        debug!(
            pool.group = %self.settings.group_name,
            endpoint = %address,
            "purged stale endpoint identity"
        );
    }

    /// 归还连接；返回 `true` 表示连接被重新入池。
    pub fn return_connection(&self, connection: PooledConnection) -> bool {
        let endpoint = {
            let state = self.state.lock();
            if state.closed {
                None
            } else {
                state.endpoints.get(connection.key()).cloned()
            }
        };
        match endpoint {
            Some(endpoint) => endpoint.return_connection(connection),
            None => false,
        }
    }

    pub fn endpoint_stats(&self, key: &EndpointKey) -> Option<EndpointPoolStats> {
        let endpoint = self.state.lock().endpoints.get(key).cloned();
        endpoint.map(|endpoint| endpoint.stats())
    }

    pub fn endpoint_keys(&self) -> Vec<EndpointKey> {
        self.state.lock().endpoints.keys().cloned().collect()
    }

    fn close_endpoints(&self) -> Vec<PooledConnection> {
        let endpoints: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.endpoints.drain().map(|(_, endpoint)| endpoint).collect()
        };
        endpoints
            .iter()
            .flat_map(|endpoint| endpoint.close())
            .collect()
    }

    /// 关闭并在截止时间内优雅关闭全部空闲连接；超时后剩余连接直接丢弃。
    pub async fn drain(&self, deadline: Deadline) -> Result<()> {
        let idle = self.close_endpoints();
        if idle.is_empty() {
            return Ok(());
        }
        let count = idle.len();
        let results = join_all(idle.into_iter().map(|connection| connection.shutdown(deadline))).await;
        let first_error = results.into_iter().find_map(|result| result.err());
        match first_error {
            Some(err) => {
                warn!(
                    pool.group = %self.settings.group_name,
                    connections = count,
                    error = %err,
                    "connection pool drain did not complete cleanly"
                );
                Err(err)
            }
            None => {
                debug!(pool.group = %self.settings.group_name, connections = count, "connection pool drained");
                Ok(())
            }
        }
    }

    /// 立即关闭，丢弃全部空闲连接。
    pub fn abort(&self) {
        let idle = self.close_endpoints();
        debug!(pool.group = %self.settings.group_name, connections = idle.len(), "connection pool aborted");
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("group", &self.settings.group_name)
            .field("refs", &state.refs)
            .field("closed", &state.closed)
            .field("endpoints", &state.endpoints.len())
            .finish()
    }
}
