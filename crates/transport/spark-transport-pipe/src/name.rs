//! 管道名发布与解析。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 命名管道服务每次启动都会监听一个新的套接字路径，逻辑 URI 与物理路径之间的映射
//!   由服务端发布、客户端查询；同一 URI 在不同时刻可能解析到不同的路径；
//! - 解析结果按目标 URI 缓存以避免每次借出连接都读文件系统，缓存在连接池发现端点
//!   失效（`EndpointNotFound`）时按 URI 精确清理，其他 URI 的缓存不受影响。
//!
//! ## 契约（What）
//! - [`PipeNameSource`]：查询当前发布的套接字路径；
//! - [`DirectoryPipeNameSource`]：以目录中的发布文件实现查询，按路径前缀由长到短匹配，
//!   使 `net.pipe://localhost/orders/v1` 可以落到发布在 `orders` 上的服务；
//! - [`PipeNameResolver`]：带 `DashMap` 缓存的端点键解析器，端点键即套接字路径。
//!
//! ## 风险与权衡（Trade-offs）
//! - 管道只在本机可达，地址中的主机名不参与匹配；
//! - 发布文件先写入临时文件再原子重命名，查询方不会读到写了一半的内容。

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use spark_channel::{
    Deadline, EndpointAddress, Result,
    pool::{EndpointKey, EndpointKeyResolver},
};
use tracing::debug;

use crate::{
    error::{LOOKUP, PUBLISH, map_io_error, not_published},
    util::run_with_deadline,
};

const PUBLICATION_SUFFIX: &str = "pipe";
const ROOT_PUBLICATION: &str = "_root";

/// 查询某个地址当前发布的套接字路径。
#[async_trait]
pub trait PipeNameSource: Send + Sync + fmt::Debug + 'static {
    async fn lookup(&self, address: &EndpointAddress, deadline: Deadline) -> Result<PathBuf>;
}

/// 以发布目录实现的管道名来源。
#[derive(Clone, Debug)]
pub struct DirectoryPipeNameSource {
    root: PathBuf,
}

impl DirectoryPipeNameSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 服务端发布：把 `path` 前缀映射到 `socket`。
    pub async fn publish(&self, path: &str, socket: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| map_io_error(PUBLISH, err))?;
        let target = self.publication_file(&normalize(path));
        let staging = target.with_extension("staging");
        tokio::fs::write(&staging, socket.as_os_str().as_encoded_bytes())
            .await
            .map_err(|err| map_io_error(PUBLISH, err))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|err| map_io_error(PUBLISH, err))?;
        debug!(prefix = %path, socket = %socket.display(), "pipe name published");
        Ok(())
    }

    /// 撤销发布；发布文件不存在时视为成功。
    pub async fn unpublish(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.publication_file(&normalize(path))).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_error(PUBLISH, err)),
        }
    }

    fn publication_file(&self, prefix: &str) -> PathBuf {
        let stem = if prefix.is_empty() {
            ROOT_PUBLICATION.to_owned()
        } else {
            prefix.replace('/', "~")
        };
        self.root.join(format!("{stem}.{PUBLICATION_SUFFIX}"))
    }
}

#[async_trait]
impl PipeNameSource for DirectoryPipeNameSource {
    async fn lookup(&self, address: &EndpointAddress, deadline: Deadline) -> Result<PathBuf> {
        let path = normalize(address.path());
        for prefix in prefixes(&path) {
            let file = self.publication_file(prefix);
            let read = run_with_deadline(deadline, LOOKUP, tokio::fs::read_to_string(&file)).await;
            match read {
                Ok(content) => {
                    let socket = content.trim();
                    if !socket.is_empty() {
                        return Ok(PathBuf::from(socket));
                    }
                }
                Err(err) if err.category() == &spark_channel::ErrorCategory::EndpointNotFound => {}
                Err(err) => return Err(err),
            }
        }
        Err(not_published(address))
    }
}

/// 小写化并去掉首尾斜杠。
fn normalize(path: &str) -> String {
    path.trim_matches('/').to_ascii_lowercase()
}

/// 由长到短的路径前缀，最后是空前缀。
fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current.is_empty() {
            None
        } else {
            Some(current.rfind('/').map_or("", |index| &current[..index]))
        };
        Some(current)
    })
}

/// 带缓存的管道端点键解析器。
#[derive(Debug)]
pub struct PipeNameResolver {
    source: Arc<dyn PipeNameSource>,
    cache: DashMap<String, PathBuf>,
}

impl PipeNameResolver {
    pub fn new(source: Arc<dyn PipeNameSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    /// 指定地址当前缓存的套接字路径。
    pub fn cached(&self, address: &EndpointAddress) -> Option<PathBuf> {
        self.cache
            .get(address.via().as_str())
            .map(|entry| entry.value().clone())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl EndpointKeyResolver for PipeNameResolver {
    async fn resolve(&self, address: &EndpointAddress, deadline: Deadline) -> Result<EndpointKey> {
        let target = address.via().as_str();
        if let Some(socket) = self.cache.get(target) {
            return Ok(EndpointKey::new(socket.to_string_lossy()));
        }
        let socket = self.source.lookup(address, deadline).await?;
        debug!(endpoint = %address, socket = %socket.display(), "pipe name resolved");
        let key = EndpointKey::new(socket.to_string_lossy());
        self.cache.insert(target.to_owned(), socket);
        Ok(key)
    }

    fn purge(&self, address: &EndpointAddress) {
        if let Some((_, socket)) = self.cache.remove(address.via().as_str()) {
            debug!(endpoint = %address, socket = %socket.display(), "stale pipe name purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(raw: &str) -> EndpointAddress {
        EndpointAddress::parse(raw).expect("地址合法")
    }

    fn deadline() -> Deadline {
        Deadline::after(std::time::Duration::from_secs(5))
    }

    #[test]
    fn prefixes_run_from_longest_to_root() {
        let all: Vec<&str> = prefixes("orders/v1/submit").collect();
        assert_eq!(all, ["orders/v1/submit", "orders/v1", "orders", ""]);
        assert_eq!(prefixes("").collect::<Vec<_>>(), [""]);
    }

    #[tokio::test]
    async fn lookup_prefers_the_most_specific_publication() {
        let dir = tempfile::tempdir().expect("创建临时目录");
        let source = DirectoryPipeNameSource::new(dir.path());
        source.publish("orders", Path::new("/run/orders.sock")).await.expect("发布");
        source.publish("/Orders/V2/", Path::new("/run/orders-v2.sock")).await.expect("发布");

        let generic = source
            .lookup(&address("net.pipe://localhost/orders/v1/submit"), deadline())
            .await
            .expect("前缀匹配");
        assert_eq!(generic, Path::new("/run/orders.sock"));
        let specific = source
            .lookup(&address("net.pipe://localhost/orders/v2/submit"), deadline())
            .await
            .expect("更长的前缀胜出");
        assert_eq!(specific, Path::new("/run/orders-v2.sock"));

        let err = source
            .lookup(&address("net.pipe://localhost/billing"), deadline())
            .await
            .expect_err("未发布");
        assert_eq!(err.category(), &spark_channel::ErrorCategory::EndpointNotFound);

        source.unpublish("orders/v2").await.expect("撤销发布");
        source.unpublish("orders/v2").await.expect("重复撤销为空操作");
        let fallback = source
            .lookup(&address("net.pipe://localhost/orders/v2/submit"), deadline())
            .await
            .expect("回落到较短前缀");
        assert_eq!(fallback, Path::new("/run/orders.sock"));
    }

    #[tokio::test]
    async fn resolver_caches_per_uri_and_purges_precisely() {
        let dir = tempfile::tempdir().expect("创建临时目录");
        let source = Arc::new(DirectoryPipeNameSource::new(dir.path()));
        source.publish("", Path::new("/run/first.sock")).await.expect("发布");
        let resolver = PipeNameResolver::new(Arc::clone(&source) as Arc<dyn PipeNameSource>);

        let orders = address("net.pipe://localhost/orders");
        let billing = address("net.pipe://localhost/billing");
        let key = resolver.resolve(&orders, deadline()).await.expect("解析");
        assert_eq!(key.as_str(), "/run/first.sock");
        resolver.resolve(&billing, deadline()).await.expect("解析");
        assert_eq!(resolver.cached_len(), 2);

        source.publish("", Path::new("/run/second.sock")).await.expect("重新发布");
        let cached = resolver.resolve(&orders, deadline()).await.expect("命中缓存");
        assert_eq!(cached.as_str(), "/run/first.sock", "缓存未清理前沿用旧名字");

        resolver.purge(&orders);
        assert!(resolver.cached(&orders).is_none());
        assert_eq!(resolver.cached(&billing), Some(PathBuf::from("/run/first.sock")), "其他 URI 不受影响");
        let fresh = resolver.resolve(&orders, deadline()).await.expect("重新解析");
        assert_eq!(fresh.as_str(), "/run/second.sock");
    }
}
