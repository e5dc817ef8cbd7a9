pub mod consume_quota;
pub mod get_usage_snapshot;
pub mod sweep_expired_usage;

pub use consume_quota::ConsumeQuotaUseCase;
pub use get_usage_snapshot::GetUsageSnapshotUseCase;
pub use sweep_expired_usage::SweepExpiredUsageUseCase;

use std::future::Future;
use std::time::Duration;

/// call_store はカウンターストア呼び出しをタイムアウト付きで実行する。
/// 失敗・タイムアウトはいずれもエラーメッセージとして返し、呼び出し側で StoreUnavailable に写像する。
pub(crate) async fn call_store<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!(operation, error = %e, "counter store call failed");
            Err(format!("{} failed: {}", operation, e))
        }
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "counter store call timed out"
            );
            Err(format!(
                "{} timed out after {}ms",
                operation,
                timeout.as_millis()
            ))
        }
    }
}
