use std::{future::Future, io};

use spark_channel::{Deadline, Result};

use crate::error::{OperationKind, map_io_error, timeout_error};

/// 在截止时间内执行一次 IO Future。
///
/// # 契约（What）
/// - 截止时间已过时不发起 IO，直接返回超时错误；
/// - IO 先于截止时间完成时按 [`map_io_error`] 映射结果；
/// - 无截止时间时等价于直接等待 `future`。
pub(crate) async fn run_with_deadline<F, T>(deadline: Deadline, kind: OperationKind, future: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if deadline.is_expired() {
        return Err(timeout_error(kind));
    }
    tokio::pin!(future);

    if let Some(instant) = deadline.instant() {
        let sleep = tokio::time::sleep_until(instant);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            result = &mut future => result.map_err(|err| map_io_error(kind, err)),
            () = &mut sleep => Err(timeout_error(kind)),
        }
    } else {
        future.await.map_err(|err| map_io_error(kind, err))
    }
}
