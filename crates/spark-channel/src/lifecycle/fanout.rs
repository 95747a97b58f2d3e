use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered, task::noop_waker_ref};
use tracing::{debug, warn};

use crate::{
    error::{ChannelError, Result},
    lifecycle::CommunicationObject,
    time::Deadline,
};

/// 批量操作的汇总结果。
#[derive(Debug)]
pub struct FanOutReport {
    /// 每个成员都在首次轮询时完成、没有任何挂起。
    pub completed_synchronously: bool,
    pub total: usize,
    pub failed: usize,
    /// 首个失败，原样保留，不做二次包装。
    pub error: Option<ChannelError>,
}

impl FanOutReport {
    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Operation {
    Open,
    Close,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Close => "close",
        }
    }

    fn start(self, object: Arc<dyn CommunicationObject>, deadline: Deadline) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self {
                Operation::Open => object.open(deadline).await,
                Operation::Close => object.close(deadline).await,
            }
        })
    }
}

/// 并发打开一组通信对象，共享同一截止时间。
pub async fn open_all(objects: &[Arc<dyn CommunicationObject>], deadline: Deadline) -> FanOutReport {
    fan_out(objects, deadline, Operation::Open).await
}

/// 并发关闭一组通信对象，共享同一截止时间。
pub async fn close_all(
    objects: &[Arc<dyn CommunicationObject>],
    deadline: Deadline,
) -> FanOutReport {
    fan_out(objects, deadline, Operation::Close).await
}

struct Gather {
    operation: Operation,
    failed: usize,
    first_error: Option<ChannelError>,
}

impl Gather {
    /// 终结单个成员：失败者被中止，只记录第一个错误。
    fn finalize(&mut self, object: &dyn CommunicationObject, result: Result<()>) {
        if let Err(err) = result {
            warn!(
                label = %object.label(),
                operation = self.operation.as_str(),
                error = %err,
                "fan-out member failed, aborting it"
            );
            object.abort();
            self.failed += 1;
            if self.first_error.is_none() {
                self.first_error = Some(err);
            }
        }
    }
}

/// 散射-聚合的核心。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - N 个对象各自打开/关闭互不依赖，串行等待会把总耗时放大为 N 倍；
/// - 所有成员共享同一个截止时间：每个成员的时间份额都是“截止时间 − 当前时间”，
///   越晚开始的成员份额越小，份额耗尽的成员立即以超时失败。
///
/// ## 执行逻辑（How）
/// 1. 依次发起每个成员的操作，并立即以空唤醒器轮询一次：就绪者当场终结；
/// 2. 仍挂起者放入 `FuturesUnordered` 并发驱动，按完成顺序逐个终结；
/// 3. 终结时失败成员一律 `abort`，只保留第一个错误；
/// 4. 全部成员终结后返回报告，`completed_synchronously` 仅在没有任何成员挂起时为真。
///
/// ## 契约（What）
/// - **后置条件**：返回时每个成员都已到达终态（成功打开/关闭，或已中止）；
/// - 错误原样透传，`Fatal` 分类的错误同样不做包装。
///
/// ## 风险与权衡（Trade-offs）
/// - 挂起成员在调用方任务内并发推进而不是派生新任务，调用方取消本 Future 时
///   未完成的成员会随之被丢弃，其状态由各自的生命周期状态机负责收敛。
async fn fan_out(
    objects: &[Arc<dyn CommunicationObject>],
    deadline: Deadline,
    operation: Operation,
) -> FanOutReport {
    let mut gather = Gather {
        operation,
        failed: 0,
        first_error: None,
    };
    let mut suspended = FuturesUnordered::new();
    // `Context` 不是 `Send`，必须在第一个 `.await` 之前离开作用域。
    {
        let mut cx = Context::from_waker(noop_waker_ref());
        for object in objects {
            let mut pending = operation.start(Arc::clone(object), deadline);
            match Pin::new(&mut pending).poll(&mut cx) {
                Poll::Ready(result) => gather.finalize(object.as_ref(), result),
                Poll::Pending => {
                    let object = Arc::clone(object);
                    suspended.push(async move {
                        let result = pending.await;
                        (object, result)
                    });
                }
            }
        }
    }

    let completed_synchronously = suspended.is_empty();
    while let Some((object, result)) = suspended.next().await {
        gather.finalize(object.as_ref(), result);
    }

    debug!(
        operation = operation.as_str(),
        total = objects.len(),
        failed = gather.failed,
        synchronous = completed_synchronously,
        "fan-out completed"
    );
    FanOutReport {
        completed_synchronously,
        total: objects.len(),
        failed: gather.failed,
        error: gather.first_error,
    }
}
