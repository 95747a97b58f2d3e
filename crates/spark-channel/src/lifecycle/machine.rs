use std::{
    borrow::Cow,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    error::{ChannelError, Result},
    lifecycle::state::CommunicationState,
    time::Deadline,
};

/// 故障回调。
pub type FaultHandler = Arc<dyn Fn() + Send + Sync>;

/// 具体通信对象在状态迁移中执行的资源动作。
///
/// # 契约（What）
/// - `on_open` / `on_close`：在 `Opening` / `Closing` 状态下执行，必须遵守截止时间；
/// - `on_abort`：同步、幂等，可能被调用多次（例如打开途中被中止时，打开结束后会再补调一次），
///   实现必须能安全地重复释放。
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_open(&self, _deadline: Deadline) -> Result<()> {
        Ok(())
    }

    async fn on_close(&self, _deadline: Deadline) -> Result<()> {
        Ok(())
    }

    fn on_abort(&self) {}
}

struct CoreInner {
    label: Cow<'static, str>,
    state: watch::Sender<CommunicationState>,
    handlers: Mutex<Vec<(u64, FaultHandler)>>,
    next_handler: AtomicU64,
}

/// 生命周期状态机的共享实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 通道工厂、传输通道、分层通道与测试替身都遵守同一套状态机；把迁移规则集中在一处，
///   具体对象只需提供 [`LifecycleHooks`]；
/// - 状态变化通过 `tokio::sync::watch` 广播，故障通知通过带作用域的回调注册，
///   订阅者丢弃 [`FaultSubscription`] 即自动注销，不存在悬挂订阅。
///
/// ## 契约（What）
/// - `open`：仅 `Created` 可进入 `Opening`；`Opened` 上重复打开为空操作；其余状态返回 `InvalidState`；
///   钩子失败时执行中止钩子并进入 `Faulted`；打开途中被中止时返回 `Aborted` 并补调中止钩子；
/// - `close`：`Closed` 上为空操作；`Faulted` 上执行中止并返回成功；`Opening` 上等待在途打开结束
///   （受关闭截止时间约束，超时则中止）；`Closing` 上等待另一方完成关闭；
/// - `abort`：任意状态可调用且幂等，直接进入 `Closed`；
/// - `fault`：非终态进入 `Faulted` 并同步调用全部故障回调。
///
/// ## 执行逻辑（How）
/// - 每次迁移都在 `watch::Sender::send_if_modified` 的闭包内“检查 + 写入”，保证并发迁移只有一方成功；
/// - 故障回调在锁外调用，回调内部可以安全地再次操作本对象。
#[derive(Clone)]
pub struct LifecycleCore {
    inner: Arc<CoreInner>,
}

/// 不持有所有权的状态机句柄，供故障回调捕获以避免引用环。
#[derive(Clone)]
pub struct WeakLifecycleCore {
    inner: Weak<CoreInner>,
}

impl WeakLifecycleCore {
    pub fn upgrade(&self) -> Option<LifecycleCore> {
        self.inner.upgrade().map(|inner| LifecycleCore { inner })
    }
}

/// 故障回调注册凭据，丢弃即注销。
#[must_use = "dropping the subscription unregisters the fault handler"]
pub struct FaultSubscription {
    core: Weak<CoreInner>,
    id: u64,
}

impl Drop for FaultSubscription {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.handlers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for FaultSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultSubscription").field("id", &self.id).finish()
    }
}

impl LifecycleCore {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        let (state, _) = watch::channel(CommunicationState::Created);
        Self {
            inner: Arc::new(CoreInner {
                label: label.into(),
                state,
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> CommunicationState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CommunicationState> {
        self.inner.state.subscribe()
    }

    pub fn downgrade(&self) -> WeakLifecycleCore {
        WeakLifecycleCore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_fault(&self, handler: FaultHandler) -> FaultSubscription {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, handler));
        FaultSubscription {
            core: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// 当 `allowed(当前状态)` 成立时迁移到 `to`；返回迁移前的状态。
    fn transition(
        &self,
        allowed: impl Fn(CommunicationState) -> bool,
        to: CommunicationState,
    ) -> std::result::Result<CommunicationState, CommunicationState> {
        let mut previous = CommunicationState::Created;
        let changed = self.inner.state.send_if_modified(|state| {
            previous = *state;
            if previous != to && allowed(previous) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed { Ok(previous) } else { Err(previous) }
    }

    /// 要求对象处于 `Opened`，用于业务操作的前置检查。
    pub fn ensure_opened(&self, operation: &str) -> Result<()> {
        match self.state() {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Faulted => Err(ChannelError::communication(format!(
                "{} is faulted and cannot {operation}",
                self.label()
            ))),
            CommunicationState::Closed | CommunicationState::Closing => Err(ChannelError::aborted(
                format!("{} is closed and cannot {operation}", self.label()),
            )),
            state => Err(ChannelError::invalid_state(format!(
                "{} must be opened before it can {operation} (current state: {state})",
                self.label()
            ))),
        }
    }

    /// 等待对象进入 `Closed`。
    pub async fn closed(&self) {
        let mut receiver = self.subscribe();
        let _ = receiver
            .wait_for(|state| *state == CommunicationState::Closed)
            .await
            .map(|_| ());
    }

    pub async fn open<H>(&self, hooks: &H, deadline: Deadline) -> Result<()>
    where
        H: LifecycleHooks + ?Sized,
    {
        match self.transition(|state| state == CommunicationState::Created, CommunicationState::Opening) {
            Ok(_) => {}
            Err(CommunicationState::Opened) => return Ok(()),
            Err(state) => {
                return Err(ChannelError::invalid_state(format!(
                    "{} cannot be opened while {state}",
                    self.label()
                )));
            }
        }
        debug!(label = %self.label(), state = "opening", "communication object opening");

        match deadline.run("open", hooks.on_open(deadline)).await {
            Ok(()) => {
                if self
                    .transition(|state| state == CommunicationState::Opening, CommunicationState::Opened)
                    .is_ok()
                {
                    debug!(label = %self.label(), state = "opened", "communication object opened");
                    Ok(())
                } else {
                    hooks.on_abort();
                    Err(ChannelError::aborted(format!(
                        "{} was aborted while opening",
                        self.label()
                    )))
                }
            }
            Err(err) => {
                hooks.on_abort();
                if self
                    .transition(|state| state == CommunicationState::Opening, CommunicationState::Faulted)
                    .is_ok()
                {
                    warn!(label = %self.label(), error = %err, "open failed, object faulted");
                    self.notify_fault_handlers();
                }
                Err(err)
            }
        }
    }

    pub async fn close<H>(&self, hooks: &H, deadline: Deadline) -> Result<()>
    where
        H: LifecycleHooks + ?Sized,
    {
        loop {
            let current = self.state();
            match current {
                CommunicationState::Closed => return Ok(()),
                CommunicationState::Faulted => {
                    self.abort(hooks);
                    return Ok(());
                }
                CommunicationState::Created => {
                    if self
                        .transition(|state| state == CommunicationState::Created, CommunicationState::Closed)
                        .is_ok()
                    {
                        hooks.on_abort();
                        debug!(label = %self.label(), "closed before open");
                        return Ok(());
                    }
                }
                CommunicationState::Opening | CommunicationState::Closing => {
                    let mut receiver = self.subscribe();
                    let waited = deadline
                        .run("close", async {
                            receiver
                                .wait_for(|state| *state != current)
                                .await
                                .map(|_| ())
                                .map_err(|_| ChannelError::aborted("state channel dropped"))
                        })
                        .await;
                    if let Err(err) = waited {
                        warn!(label = %self.label(), state = %current, "close timed out waiting, aborting");
                        self.abort(hooks);
                        return Err(err);
                    }
                }
                CommunicationState::Opened => {
                    if self
                        .transition(|state| state == CommunicationState::Opened, CommunicationState::Closing)
                        .is_err()
                    {
                        continue;
                    }
                    debug!(label = %self.label(), state = "closing", "communication object closing");
                    return match deadline.run("close", hooks.on_close(deadline)).await {
                        Ok(()) => {
                            let _ = self.transition(
                                |state| state == CommunicationState::Closing,
                                CommunicationState::Closed,
                            );
                            debug!(label = %self.label(), state = "closed", "communication object closed");
                            Ok(())
                        }
                        Err(err) => {
                            warn!(label = %self.label(), error = %err, "graceful close failed, aborting");
                            self.abort(hooks);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    pub fn abort<H>(&self, hooks: &H)
    where
        H: LifecycleHooks + ?Sized,
    {
        if let Ok(previous) = self.transition(|_| true, CommunicationState::Closed) {
            debug!(label = %self.label(), from = %previous, "communication object aborted");
            hooks.on_abort();
        }
    }

    /// 进入 `Faulted`；返回 `false` 表示对象已处于终态。
    pub fn fault(&self) -> bool {
        if self
            .transition(|state| !state.is_terminal(), CommunicationState::Faulted)
            .is_err()
        {
            return false;
        }
        warn!(label = %self.label(), "communication object faulted");
        self.notify_fault_handlers();
        true
    }

    fn notify_fault_handlers(&self) {
        let handlers: Vec<FaultHandler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler();
        }
    }
}

impl fmt::Debug for LifecycleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCore")
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Probe {
        aborts: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail_open: AtomicBool,
    }

    #[async_trait]
    impl LifecycleHooks for Probe {
        async fn on_open(&self, _deadline: Deadline) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(ChannelError::communication("refused"));
            }
            Ok(())
        }

        fn on_abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn long() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn open_close_transitions() {
        let core = LifecycleCore::new("probe");
        let probe = Probe::default();
        core.open(&probe, long()).await.expect("首次打开应成功");
        core.open(&probe, long()).await.expect("重复打开为空操作");
        assert_eq!(core.state(), CommunicationState::Opened);

        core.close(&probe, long()).await.expect("关闭应成功");
        assert_eq!(core.state(), CommunicationState::Closed);
        core.close(&probe, long()).await.expect("重复关闭为空操作");

        let err = core.open(&probe, long()).await.expect_err("关闭后不可再打开");
        assert_eq!(err.category(), &ErrorCategory::InvalidState);
        assert_eq!(probe.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_open_faults_and_close_aborts() {
        let core = LifecycleCore::new("probe");
        let probe = Probe::default();
        probe.fail_open.store(true, Ordering::SeqCst);

        let faults = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&faults);
        let _subscription = core.on_fault(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        core.open(&probe, long()).await.expect_err("钩子失败应传递错误");
        assert_eq!(core.state(), CommunicationState::Faulted);
        assert_eq!(faults.load(Ordering::SeqCst), 1);

        core.close(&probe, long()).await.expect("Faulted 上关闭等价于中止");
        assert_eq!(core.state(), CommunicationState::Closed);
        assert!(probe.aborts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn abort_during_open_reports_aborted_and_reruns_hook() {
        let gate = Arc::new(Notify::new());
        let probe = Arc::new(Probe {
            gate: Some(Arc::clone(&gate)),
            ..Probe::default()
        });
        let core = LifecycleCore::new("probe");

        let opener = {
            let core = core.clone();
            let probe = Arc::clone(&probe);
            tokio::spawn(async move { core.open(&*probe, long()).await })
        };
        let mut states = core.subscribe();
        states
            .wait_for(|state| *state == CommunicationState::Opening)
            .await
            .expect("状态通道存活");

        core.abort(&*probe);
        assert_eq!(core.state(), CommunicationState::Closed);
        gate.notify_one();

        let err = opener
            .await
            .expect("打开任务不应 panic")
            .expect_err("被中止的打开应失败");
        assert_eq!(err.category(), &ErrorCategory::Aborted);
        assert_eq!(probe.aborts.load(Ordering::SeqCst), 2, "中止钩子应在打开结束后补调");
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_open() {
        let gate = Arc::new(Notify::new());
        let probe = Arc::new(Probe {
            gate: Some(Arc::clone(&gate)),
            ..Probe::default()
        });
        let core = LifecycleCore::new("probe");

        let opener = {
            let core = core.clone();
            let probe = Arc::clone(&probe);
            tokio::spawn(async move { core.open(&*probe, long()).await })
        };
        let mut states = core.subscribe();
        states
            .wait_for(|state| *state == CommunicationState::Opening)
            .await
            .expect("状态通道存活");

        let closer = {
            let core = core.clone();
            let probe = Arc::clone(&probe);
            tokio::spawn(async move { core.close(&*probe, long()).await })
        };
        tokio::task::yield_now().await;
        gate.notify_one();

        opener.await.expect("打开任务不应 panic").expect("打开应成功");
        closer.await.expect("关闭任务不应 panic").expect("关闭应在打开完成后成功");
        assert_eq!(core.state(), CommunicationState::Closed);
    }

    #[test]
    fn dropping_subscription_unregisters_handler() {
        let core = LifecycleCore::new("probe");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let subscription = core.on_fault(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        drop(subscription);
        assert!(core.fault());
        assert!(!core.fault(), "终态上再次故障无效");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
