use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::Result,
    pool::{
        connection_pool::ConnectionPool, connector::EndpointKeyResolver,
        settings::ConnectionPoolSettings,
    },
    time::Deadline,
};

/// 判定已有连接池能否服务新设置的谓词。
pub type CompatibilityPredicate =
    dyn Fn(&ConnectionPoolSettings, &ConnectionPoolSettings) -> bool + Send + Sync;

/// 连接池注册表：分组键 → 一组互相兼容的连接池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 多个通道工厂指向同一服务时应共享连接，注册表负责按设置找到可共享的池；
/// - 注册表是显式构造、显式传递的共享对象，每种传输各持有一个实例，不存在隐式全局状态。
///
/// ## 契约（What）
/// - `lookup(settings, resolver)`：返回**已打开**且与 `settings` 兼容的池，未命中时新建；
/// - `release(pool, deadline)`：减少引用，归零时先从注册表摘除，再在锁外排空；
///   即使排空超时，池也已经摘除，不会遗留注册项；
/// - `abort_release(pool)`：同步版本，归零时立即丢弃空闲连接。
///
/// ## 执行逻辑（How）
/// - 单把 `parking_lot::Mutex` 保护分组表的插入、删除与查找；
/// - 同一分组内按插入顺序线性匹配兼容谓词，并通过 `try_open` 原子地增加引用，
///   跳过恰好在关闭中的池；
/// - 默认兼容谓词要求设置完全相等，传输可以注入更宽松的谓词（如命名管道忽略租约超时）。
///
/// ## 风险与权衡（Trade-offs）
/// - 线性匹配在分组内池数量很少的前提下足够；分组内设置组合爆炸时应改用更细的分组键。
pub struct ConnectionPoolRegistry {
    transport: &'static str,
    groups: Mutex<HashMap<String, Vec<Arc<ConnectionPool>>>>,
    compatible: Box<CompatibilityPredicate>,
}

impl ConnectionPoolRegistry {
    /// 以“设置完全相等”为兼容谓词创建注册表。
    pub fn new(transport: &'static str) -> Self {
        Self::with_compatibility(transport, |existing, requested| existing == requested)
    }

    pub fn with_compatibility(
        transport: &'static str,
        compatible: impl Fn(&ConnectionPoolSettings, &ConnectionPoolSettings) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            transport,
            groups: Mutex::new(HashMap::new()),
            compatible: Box::new(compatible),
        }
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    /// 查找或创建兼容的连接池，返回时已经持有一份引用。
    pub fn lookup(
        &self,
        settings: &ConnectionPoolSettings,
        resolver: Arc<dyn EndpointKeyResolver>,
    ) -> Result<Arc<ConnectionPool>> {
        settings.validate()?;
        let mut groups = self.groups.lock();
        let pools = groups.entry(settings.group_name.clone()).or_default();
        for pool in pools.iter() {
            if (self.compatible)(pool.settings(), settings) && pool.try_open() {
                debug!(
                    transport = self.transport,
                    pool.group = %settings.group_name,
                    "connection pool lookup hit"
                );
                return Ok(Arc::clone(pool));
            }
        }
        let pool = Arc::new(ConnectionPool::new(settings.clone(), resolver));
        pools.push(Arc::clone(&pool));
        debug!(
            transport = self.transport,
            pool.group = %settings.group_name,
            pools = pools.len(),
            "connection pool lookup miss, created pool"
        );
        Ok(pool)
    }

    /// 释放一份引用；最后一份引用释放时摘除并排空连接池。
    pub async fn release(&self, pool: &Arc<ConnectionPool>, deadline: Deadline) -> Result<()> {
        if !self.unregister_if_last(pool) {
            return Ok(());
        }
        pool.drain(deadline).await.inspect_err(|err| {
            warn!(
                transport = self.transport,
                pool.group = %pool.name(),
                error = %err,
                "connection pool released with unclean drain"
            );
        })
    }

    /// 同步释放一份引用；最后一份引用释放时立即丢弃空闲连接。
    pub fn abort_release(&self, pool: &Arc<ConnectionPool>) {
        if self.unregister_if_last(pool) {
            pool.abort();
        }
    }

    fn unregister_if_last(&self, pool: &Arc<ConnectionPool>) -> bool {
        let mut groups = self.groups.lock();
        if !pool.close_ref() {
            return false;
        }
        if let Some(pools) = groups.get_mut(pool.name()) {
            pools.retain(|candidate| !Arc::ptr_eq(candidate, pool));
            if pools.is_empty() {
                groups.remove(pool.name());
            }
        }
        debug!(transport = self.transport, pool.group = %pool.name(), "connection pool unregistered");
        true
    }

    /// 当前注册的连接池数量。
    pub fn pool_count(&self) -> usize {
        self.groups.lock().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for ConnectionPoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolRegistry")
            .field("transport", &self.transport)
            .field("pools", &self.pool_count())
            .finish()
    }
}
