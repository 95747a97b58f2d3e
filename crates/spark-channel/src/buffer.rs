use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;

/// `QueuedObjectPool` 为短生命周期、频繁租借的对象（典型为帧读取缓冲 `Vec<u8>`）
/// 提供按批分配的自由队列。
///
/// # 模块角色（Why）
/// - 传输通道每读取一个信封都需要一块缓冲；逐个分配会让相邻缓冲散落在堆上，
///   批量预分配可以改善内存局部性并摊薄分配开销；
/// - 回收是“建议性”的：池满或已关闭时直接丢弃对象，调用方无需处理任何失败分支。
///
/// # 核心机制（How）
/// - 内部维护 `parking_lot::Mutex<VecDeque<T>>` 作为自由队列；
/// - 队列为空时一次性调用工厂构造 `batch_size` 个对象，返回其中一个，其余入队；
/// - `return_item` 在队列长度达到 `max_free` 或池已关闭时丢弃对象。
///
/// # 契约说明（What）
/// - **线程安全**：实例满足 `Send + Sync`，可经 `Arc` 在多个通道之间共享；
/// - **前置条件**：`batch_size` 与 `max_free` 至少为 1，构造时自动钳制；
/// - **后置条件**：任何时刻自由队列长度 `<= max_free`；`take` 永不失败。
///
/// # 设计权衡（Trade-offs）
/// - 批量分配可能一次性创建超过当前需求的对象，换取后续租借的零分配；
/// - 关闭后的 `take` 仍会构造新对象，保证关闭过程中的在途读取可以完成。
pub struct QueuedObjectPool<T> {
    state: Mutex<QueueState<T>>,
    batch_size: usize,
    max_free: usize,
    factory: Arc<dyn Fn() -> T + Send + Sync>,
}

struct QueueState<T> {
    free: VecDeque<T>,
    closed: bool,
}

impl<T> QueuedObjectPool<T> {
    /// 创建对象池。
    ///
    /// # 参数
    /// - `batch_size`：队列为空时一次构造的对象数量；
    /// - `max_free`：自由队列上限，超出的回收对象会被丢弃；
    /// - `factory`：对象构造函数。
    pub fn new(
        batch_size: usize,
        max_free: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let max_free = max_free.max(1);
        Self {
            state: Mutex::new(QueueState {
                free: VecDeque::with_capacity(max_free),
                closed: false,
            }),
            batch_size: batch_size.clamp(1, max_free),
            max_free,
            factory: Arc::new(factory),
        }
    }

    /// 取出一个对象。
    pub fn take(&self) -> T {
        let mut state = self.state.lock();
        if let Some(item) = state.free.pop_front() {
            return item;
        }
        if state.closed {
            drop(state);
            return (self.factory)();
        }
        for _ in 1..self.batch_size {
            state.free.push_back((self.factory)());
        }
        drop(state);
        (self.factory)()
    }

    /// 归还对象；返回 `false` 表示对象被丢弃。
    pub fn return_item(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.free.len() >= self.max_free {
            return false;
        }
        state.free.push_back(item);
        true
    }

    /// 关闭对象池并释放全部空闲对象。
    pub fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.free)
        };
        drop(drained);
    }

    /// 当前自由队列长度。
    pub fn idle_len(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T> fmt::Debug for QueuedObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QueuedObjectPool")
            .field("idle", &state.free.len())
            .field("closed", &state.closed)
            .field("batch_size", &self.batch_size)
            .field("max_free", &self.max_free)
            .finish()
    }
}

/// 帧读取缓冲池的便捷构造：每块缓冲预留 `capacity` 字节。
pub fn byte_buffer_pool(capacity: usize, max_free: usize) -> QueuedObjectPool<Vec<u8>> {
    let batch = (max_free / 4).max(1);
    QueuedObjectPool::new(batch, max_free, move || Vec::with_capacity(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(batch: usize, max_free: usize) -> (QueuedObjectPool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = QueuedObjectPool::new(batch, max_free, move || {
            counter.fetch_add(1, Ordering::SeqCst)
        });
        (pool, created)
    }

    #[test]
    fn empty_queue_allocates_a_whole_batch() {
        let (pool, created) = counting_pool(4, 8);
        let _first = pool.take();
        assert_eq!(created.load(Ordering::SeqCst), 4, "首次租借应一次构造整批对象");
        assert_eq!(pool.idle_len(), 3);

        for _ in 0..3 {
            pool.take();
        }
        assert_eq!(created.load(Ordering::SeqCst), 4, "批内对象耗尽前不应再次分配");
    }

    #[test]
    fn return_is_advisory_when_full_or_closed() {
        let (pool, _) = counting_pool(1, 2);
        assert!(pool.return_item(10));
        assert!(pool.return_item(11));
        assert!(!pool.return_item(12), "超过上限的对象应被静默丢弃");
        assert_eq!(pool.idle_len(), 2);

        pool.close();
        assert_eq!(pool.idle_len(), 0);
        assert!(!pool.return_item(13), "关闭后的归还应被静默丢弃");
        let _still_served = pool.take();
        assert_eq!(pool.idle_len(), 0, "关闭后不再批量入队");
    }
}
