use std::{future::Future, io};

use spark_channel::{Deadline, Result};

use crate::error::{OperationKind, map_io_error, timeout_error};

/// 在截止时间内执行一次 IO；截止时间已过时不发起 IO。
pub(crate) async fn run_with_deadline<F, T>(deadline: Deadline, kind: OperationKind, future: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if deadline.is_expired() {
        return Err(timeout_error(kind));
    }
    match deadline.instant() {
        Some(instant) => match tokio::time::timeout_at(instant, future).await {
            Ok(result) => result.map_err(|err| map_io_error(kind, err)),
            Err(_) => Err(timeout_error(kind)),
        },
        None => future.await.map_err(|err| map_io_error(kind, err)),
    }
}
