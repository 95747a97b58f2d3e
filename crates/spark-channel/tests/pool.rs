//! 连接池：注册表复用与摘除、溢出策略、惰性淘汰与端点身份清理。

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_channel::{
    ChannelError, EndpointAddress, Result,
    error::ErrorCategory,
    pool::{
        ConnectionPoolRegistry, ConnectionPoolSettings, Connector, EndpointKey, EndpointKeyResolver,
        EndpointPoolStats, OverflowPolicy,
    },
    stream::BoxedStream,
    time::Deadline,
};
use tokio::io::DuplexStream;

/// 建连计数器；服务端半边保存在内部以保持连接存活。
#[derive(Debug, Default)]
struct CountingConnector {
    connects: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
    stale: Mutex<HashSet<String>>,
}

impl CountingConnector {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, key: &EndpointKey, _address: &EndpointAddress, _deadline: Deadline) -> Result<BoxedStream> {
        if self.stale.lock().contains(key.as_str()) {
            return Err(ChannelError::endpoint_not_found(format!("`{key}` is gone")));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1024);
        self.peers.lock().push(server);
        Ok(Box::new(client))
    }
}

#[derive(Debug, Default)]
struct HostResolver {
    purged: Mutex<Vec<String>>,
}

#[async_trait]
impl EndpointKeyResolver for HostResolver {
    async fn resolve(&self, address: &EndpointAddress, _deadline: Deadline) -> Result<EndpointKey> {
        Ok(EndpointKey::new(address.host()))
    }

    fn purge(&self, address: &EndpointAddress) {
        self.purged.lock().push(address.host());
    }
}

fn address(host: &str) -> EndpointAddress {
    EndpointAddress::parse(&format!("mem://{host}/svc")).expect("地址合法")
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

fn settings(overflow: OverflowPolicy) -> ConnectionPoolSettings {
    ConnectionPoolSettings::default()
        .with_max_connections(2)
        .with_overflow(overflow)
}

#[tokio::test]
async fn lookup_reuses_compatible_pools_and_teardown_removes_them() {
    let registry = ConnectionPoolRegistry::new("mem");
    let resolver: Arc<dyn EndpointKeyResolver> = Arc::new(HostResolver::default());
    let base = ConnectionPoolSettings::default();

    let first = registry.lookup(&base, Arc::clone(&resolver)).expect("首次查找创建连接池");
    let second = registry.lookup(&base, Arc::clone(&resolver)).expect("再次查找命中");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.ref_count(), 2);

    let other_lease = base.clone().with_lease_timeout(Some(Duration::from_secs(5)));
    let distinct = registry.lookup(&other_lease, Arc::clone(&resolver)).expect("不兼容设置创建新池");
    assert!(!Arc::ptr_eq(&first, &distinct));
    assert_eq!(distinct.name(), first.name(), "同一分组键下并存");
    assert_eq!(registry.pool_count(), 2);

    registry.release(&first, deadline()).await.expect("释放一份引用");
    assert_eq!(registry.pool_count(), 2, "仍有引用时保留注册");
    registry.release(&second, deadline()).await.expect("释放最后一份引用");
    assert!(first.is_closed());
    assert_eq!(registry.pool_count(), 1);

    let recreated = registry.lookup(&base, resolver).expect("摘除后重新创建");
    assert!(!Arc::ptr_eq(&first, &recreated));
    assert!(!recreated.is_closed());
    registry.abort_release(&distinct);
    registry.abort_release(&recreated);
    assert_eq!(registry.pool_count(), 0);
}

#[tokio::test]
async fn invalid_settings_are_rejected_at_lookup() {
    let registry = ConnectionPoolRegistry::new("mem");
    let err = registry
        .lookup(
            &ConnectionPoolSettings::default().with_max_connections(0),
            Arc::new(HostResolver::default()),
        )
        .expect_err("零容量非法");
    assert_eq!(err.category(), &ErrorCategory::Configuration);
    assert_eq!(registry.pool_count(), 0);
}

#[tokio::test]
async fn overflow_creates_unpooled_connections_beyond_capacity() {
    let registry = ConnectionPoolRegistry::new("mem");
    let connector = CountingConnector::default();
    let pool = registry
        .lookup(&settings(OverflowPolicy::CreateUnpooled), Arc::new(HostResolver::default()))
        .expect("创建连接池");
    let target = address("alpha");

    let a = pool.take(&target, &connector, deadline()).await.expect("第一个");
    let b = pool.take(&target, &connector, deadline()).await.expect("第二个");
    let c = pool.take(&target, &connector, deadline()).await.expect("超容量时立即新建");
    assert!(a.is_pooled() && b.is_pooled());
    assert!(!c.is_pooled());
    assert_eq!(connector.connects(), 3);

    let key = EndpointKey::new("alpha");
    assert_eq!(pool.endpoint_stats(&key), Some(EndpointPoolStats { idle: 0, leased: 2 }));
    assert!(!pool.return_connection(c), "非池化连接归还时被丢弃");
    assert!(pool.return_connection(a));
    assert_eq!(pool.endpoint_stats(&key), Some(EndpointPoolStats { idle: 1, leased: 1 }));
    drop(b);
    assert_eq!(pool.endpoint_stats(&key), Some(EndpointPoolStats { idle: 1, leased: 0 }));
}

#[tokio::test]
async fn overflow_wait_blocks_until_a_connection_returns() {
    let registry = ConnectionPoolRegistry::new("mem");
    let connector = Arc::new(CountingConnector::default());
    let pool = registry
        .lookup(&settings(OverflowPolicy::Wait), Arc::new(HostResolver::default()))
        .expect("创建连接池");
    let target = address("alpha");

    let a = pool.take(&target, connector.as_ref(), deadline()).await.expect("第一个");
    let _b = pool.take(&target, connector.as_ref(), deadline()).await.expect("第二个");

    let waiter = {
        let pool = Arc::clone(&pool);
        let connector = Arc::clone(&connector);
        let target = target.clone();
        tokio::spawn(async move { pool.take(&target, connector.as_ref(), deadline()).await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!waiter.is_finished(), "容量耗尽时第三个借用者应等待");

    assert!(pool.return_connection(a));
    let third = waiter
        .await
        .expect("等待任务不应 panic")
        .expect("归还后等待者应拿到连接");
    assert!(third.is_pooled());
    assert_eq!(connector.connects(), 2, "等待者复用了归还的连接");
}

#[tokio::test(start_paused = true)]
async fn overflow_wait_times_out_at_the_deadline() {
    let registry = ConnectionPoolRegistry::new("mem");
    let connector = CountingConnector::default();
    let pool = registry
        .lookup(&settings(OverflowPolicy::Wait), Arc::new(HostResolver::default()))
        .expect("创建连接池");
    let target = address("alpha");

    let _a = pool.take(&target, &connector, deadline()).await.expect("第一个");
    let _b = pool.take(&target, &connector, deadline()).await.expect("第二个");
    let err = pool
        .take(&target, &connector, Deadline::after(Duration::from_millis(100)))
        .await
        .expect_err("截止时间内没有空位");
    assert!(err.is_timeout());
    assert!(err.is_retryable());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_connections_are_evicted_lazily_on_next_touch() {
    let registry = ConnectionPoolRegistry::new("mem");
    let connector = CountingConnector::default();
    let pool = registry
        .lookup(
            &ConnectionPoolSettings::default()
                .with_idle_timeout(Duration::from_secs(1))
                .with_lease_timeout(Some(Duration::from_secs(30))),
            Arc::new(HostResolver::default()),
        )
        .expect("创建连接池");
    let target = address("alpha");
    let key = EndpointKey::new("alpha");

    let first = pool.take(&target, &connector, deadline()).await.expect("新建连接");
    assert!(pool.return_connection(first));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(
        pool.endpoint_stats(&key),
        Some(EndpointPoolStats { idle: 1, leased: 0 }),
        "过期连接在被触达之前仍留在空闲队列"
    );

    let second = pool.take(&target, &connector, deadline()).await.expect("借出时淘汰过期连接并新建");
    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.endpoint_stats(&key), Some(EndpointPoolStats { idle: 0, leased: 1 }));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!pool.return_connection(second), "已超时的连接归还时被丢弃");
}

#[tokio::test(start_paused = true)]
async fn time_spent_on_loan_does_not_count_as_idle() {
    let registry = ConnectionPoolRegistry::new("mem");
    let connector = CountingConnector::default();
    let pool = registry
        .lookup(
            &ConnectionPoolSettings::default()
                .with_idle_timeout(Duration::from_secs(10))
                .with_lease_timeout(None),
            Arc::new(HostResolver::default()),
        )
        .expect("创建连接池");
    let target = address("alpha");

    let connection = pool.take(&target, &connector, deadline()).await.expect("新建连接");
    assert!(pool.return_connection(connection));

    tokio::time::advance(Duration::from_secs(6)).await;
    let connection = pool.take(&target, &connector, deadline()).await.expect("复用空闲连接");
    assert_eq!(connector.connects(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(pool.return_connection(connection), "空闲从未超过 6 秒的连接应回到空闲队列");

    tokio::time::advance(Duration::from_secs(6)).await;
    let _connection = pool.take(&target, &connector, deadline()).await.expect("再次复用");
    assert_eq!(connector.connects(), 1, "空闲计时从归还时刻重新开始");
}

#[tokio::test]
async fn stale_endpoint_identity_is_purged_without_touching_other_endpoints() {
    let registry = ConnectionPoolRegistry::new("mem");
    let connector = CountingConnector::default();
    let resolver = Arc::new(HostResolver::default());
    let pool = registry
        .lookup(&ConnectionPoolSettings::default(), Arc::clone(&resolver) as Arc<dyn EndpointKeyResolver>)
        .expect("创建连接池");

    let healthy = pool.take(&address("alpha"), &connector, deadline()).await.expect("健康端点");
    assert!(pool.return_connection(healthy));
    let warm = pool.take(&address("beta"), &connector, deadline()).await.expect("预热 beta");
    assert!(pool.return_connection(warm));

    connector.stale.lock().insert("beta".to_owned());
    let beta = pool.take(&address("beta"), &connector, deadline()).await;
    assert!(beta.is_ok(), "空闲连接仍可复用，身份失效只在建连时暴露");
    drop(beta);

    let err = pool
        .take(&address("beta"), &connector, deadline())
        .await
        .expect_err("建连时发现端点身份失效");
    assert_eq!(err.category(), &ErrorCategory::EndpointNotFound);
    assert_eq!(resolver.purged.lock().as_slice(), ["beta".to_owned()]);

    let keys: Vec<String> = pool.endpoint_keys().iter().map(|key| key.as_str().to_owned()).collect();
    assert_eq!(keys, vec!["alpha".to_owned()]);
    assert_eq!(
        pool.endpoint_stats(&EndpointKey::new("alpha")),
        Some(EndpointPoolStats { idle: 1, leased: 0 })
    );
}
