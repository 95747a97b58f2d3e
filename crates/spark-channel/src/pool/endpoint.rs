use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError},
    time::Instant,
};
use tracing::debug;

use crate::{
    address::EndpointAddress,
    error::{ChannelError, Result},
    pool::{
        connector::{Connector, EndpointKey},
        settings::{ConnectionPoolSettings, OverflowPolicy},
    },
    stream::{BoxedStream, DetectEofStream, upgrade::RemoteSecurity},
    time::Deadline,
};

/// 单端点的连接计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointPoolStats {
    /// 空闲队列中的连接数（可能包含已过期但尚未被触达的连接）。
    pub idle: usize,
    /// 占用容量且正被借出的连接数，不含超容量创建的非池化连接。
    pub leased: usize,
}

/// 连接的租约元数据，与字节流分离以便在升级握手期间单独持有。
///
/// 租约持有容量许可（`permit`）；租约被丢弃即释放容量，超时取消或握手失败都不会泄漏槽位。
pub struct ConnectionLease {
    key: EndpointKey,
    created_at: Instant,
    last_used: Instant,
    permit: Option<OwnedSemaphorePermit>,
    remote_security: Option<RemoteSecurity>,
    prepared: bool,
}

impl ConnectionLease {
    /// 重新装配字节流。
    pub fn attach(self, stream: BoxedStream) -> PooledConnection {
        PooledConnection {
            stream: DetectEofStream::new(stream),
            lease: self,
        }
    }

    /// 标记会话前导（含升级）已完成，并记录升级得到的远端身份。
    pub fn mark_prepared(&mut self, remote_security: Option<RemoteSecurity>) {
        self.prepared = true;
        self.remote_security = remote_security;
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("key", &self.key)
            .field("pooled", &self.permit.is_some())
            .field("prepared", &self.prepared)
            .finish()
    }
}

/// 从连接池借出的连接，借用期间由借用者独占。
pub struct PooledConnection {
    stream: DetectEofStream<BoxedStream>,
    lease: ConnectionLease,
}

impl PooledConnection {
    pub fn key(&self) -> &EndpointKey {
        &self.lease.key
    }

    /// 是否占用池容量；超容量创建的连接归还时会被丢弃。
    pub fn is_pooled(&self) -> bool {
        self.lease.permit.is_some()
    }

    /// 会话前导是否已经在这条连接上完成。
    pub fn is_prepared(&self) -> bool {
        self.lease.prepared
    }

    pub fn remote_security(&self) -> Option<&RemoteSecurity> {
        self.lease.remote_security.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.lease.created_at
    }

    pub fn stream_mut(&mut self) -> &mut DetectEofStream<BoxedStream> {
        &mut self.stream
    }

    /// 拆出字节流以执行需要所有权的升级握手。
    pub fn into_parts(self) -> (BoxedStream, ConnectionLease) {
        (self.stream.into_inner(), self.lease)
    }

    /// 对端是否已关闭。
    pub fn saw_eof(&self) -> bool {
        self.stream.is_eof()
    }

    /// 在截止时间内优雅关闭写半部。
    pub async fn shutdown(mut self, deadline: Deadline) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        deadline
            .run("connection shutdown", async {
                self.stream
                    .shutdown()
                    .await
                    .map_err(|err| ChannelError::from_io("connection shutdown", err))
            })
            .await
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("lease", &self.lease)
            .field("eof", &self.stream.is_eof())
            .finish()
    }
}

/// 单端点连接池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一端点的连接建立代价高（三次握手、会话前导、升级握手），借还之间复用可显著降低延迟；
/// - 容量上限约束对同一端点的并发连接数，避免压垮对端。
///
/// ## 契约（What）
/// - 容量以 `tokio::sync::Semaphore` 许可表示：空闲连接与借出的池化连接各持有一个许可；
/// - `acquire`：优先复用未过期的空闲连接，其次占用空闲许可新建连接，容量耗尽时按
///   [`OverflowPolicy`] 新建非池化连接或等待；
/// - `return_connection`：仍在有效期内、未观测到 EOF 的池化连接回到空闲队列，否则丢弃；
/// - **不变式**：同一连接不会被同时借出两次，空闲队列中的连接不属于任何借用者。
///
/// ## 执行逻辑（How）
/// - 过期检查是惰性的：只在借出与归还时检查，没有后台清扫任务；
/// - 租约超时自创建时刻起算，借出与归还时都检查；
/// - 空闲超时自最后一次归还起算，只在借出时检查：借用期间的耗时不算空闲；
/// - 等待者同时监听“许可释放”与“空闲连接归还”，两者任一发生即重试。
///
/// ## 风险与权衡（Trade-offs）
/// - 惰性淘汰意味着过期连接会在空闲队列里多占用一段时间资源，但不会被借出；
/// - 空闲队列按后进先出复用，最近使用的连接最可能仍然健康。
pub struct EndpointConnectionPool {
    key: EndpointKey,
    settings: Arc<ConnectionPoolSettings>,
    idle: Mutex<Vec<PooledConnection>>,
    permits: Arc<Semaphore>,
    returned: Notify,
}

impl EndpointConnectionPool {
    pub fn new(key: EndpointKey, settings: Arc<ConnectionPoolSettings>) -> Self {
        let capacity = settings.max_outbound_connections_per_endpoint;
        Self {
            key,
            settings,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            permits: Arc::new(Semaphore::new(capacity)),
            returned: Notify::new(),
        }
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    fn lease_expired(&self, lease: &ConnectionLease, now: Instant) -> bool {
        self.settings
            .lease_timeout
            .is_some_and(|lease_timeout| now.saturating_duration_since(lease.created_at) >= lease_timeout)
    }

    /// 空闲时长只统计连接躺在空闲队列里的时间，借出期间不计入。
    fn idle_expired(&self, lease: &ConnectionLease, now: Instant) -> bool {
        now.saturating_duration_since(lease.last_used) >= self.settings.idle_timeout
    }

    /// 取出一个未过期的空闲连接，顺带淘汰途经的过期连接。
    fn take_idle(&self) -> Option<PooledConnection> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let found = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(connection) = idle.pop() {
                if connection.saw_eof()
                    || self.lease_expired(&connection.lease, now)
                    || self.idle_expired(&connection.lease, now)
                {
                    evicted.push(connection);
                } else {
                    found = Some(connection);
                    break;
                }
            }
            found
        };
        if !evicted.is_empty() {
            debug!(endpoint = %self.key, evicted = evicted.len(), "evicted expired idle connections");
        }
        drop(evicted);
        found
    }

    /// 借出一条连接。
    pub async fn acquire(
        &self,
        address: &EndpointAddress,
        connector: &dyn Connector,
        deadline: Deadline,
    ) -> Result<PooledConnection> {
        loop {
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            if let Some(connection) = self.take_idle() {
                debug!(endpoint = %self.key, "reusing idle connection");
                return Ok(connection);
            }

            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => return self.connect(Some(permit), address, connector, deadline).await,
                Err(TryAcquireError::Closed) => return Err(pool_closed(&self.key)),
                Err(TryAcquireError::NoPermits) => {}
            }

            match self.settings.overflow {
                OverflowPolicy::CreateUnpooled => {
                    debug!(endpoint = %self.key, "endpoint at capacity, creating unpooled connection");
                    return self.connect(None, address, connector, deadline).await;
                }
                OverflowPolicy::Wait => {
                    debug!(endpoint = %self.key, "endpoint at capacity, waiting for a slot");
                    let permits = Arc::clone(&self.permits);
                    let waited = deadline
                        .run("wait for pooled connection", async {
                            tokio::select! {
                                permit = permits.acquire_owned() => permit
                                    .map(Some)
                                    .map_err(|_| pool_closed(&self.key)),
                                () = returned.as_mut() => Ok(None),
                            }
                        })
                        .await?;
                    if let Some(permit) = waited {
                        return self.connect(Some(permit), address, connector, deadline).await;
                    }
                }
            }
        }
    }

    async fn connect(
        &self,
        permit: Option<OwnedSemaphorePermit>,
        address: &EndpointAddress,
        connector: &dyn Connector,
        deadline: Deadline,
    ) -> Result<PooledConnection> {
        let stream = deadline
            .run("connect", connector.connect(&self.key, address, deadline))
            .await?;
        let now = Instant::now();
        debug!(endpoint = %self.key, pooled = permit.is_some(), "established new connection");
        Ok(ConnectionLease {
            key: self.key.clone(),
            created_at: now,
            last_used: now,
            permit,
            remote_security: None,
            prepared: false,
        }
        .attach(stream))
    }

    /// 归还连接；返回 `true` 表示连接回到空闲队列。
    pub fn return_connection(&self, mut connection: PooledConnection) -> bool {
        let now = Instant::now();
        let owned_here = connection
            .lease
            .permit
            .as_ref()
            .is_some_and(|permit| Arc::ptr_eq(permit.semaphore(), &self.permits));
        if self.permits.is_closed()
            || !owned_here
            || connection.saw_eof()
            || self.lease_expired(&connection.lease, now)
        {
            debug!(endpoint = %self.key, "discarding returned connection");
            return false;
        }
        connection.lease.last_used = now;
        self.idle.lock().push(connection);
        self.returned.notify_one();
        true
    }

    pub fn stats(&self) -> EndpointPoolStats {
        let idle = self.idle.lock().len();
        let in_use = self
            .settings
            .max_outbound_connections_per_endpoint
            .saturating_sub(self.permits.available_permits());
        EndpointPoolStats {
            idle,
            leased: in_use.saturating_sub(idle),
        }
    }

    /// 关闭端点池：拒绝后续借出，返回全部空闲连接供调用方关闭。
    pub fn close(&self) -> Vec<PooledConnection> {
        self.permits.close();
        self.returned.notify_waiters();
        std::mem::take(&mut *self.idle.lock())
    }
}

impl fmt::Debug for EndpointConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConnectionPool")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish()
    }
}

fn pool_closed(key: &EndpointKey) -> ChannelError {
    ChannelError::aborted(format!("connection pool for `{key}` is closed"))
}
