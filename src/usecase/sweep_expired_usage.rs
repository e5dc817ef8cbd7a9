use std::sync::Arc;

use crate::domain::repository::CounterStore;
use crate::domain::service::Clock;

#[derive(Debug, thiserror::Error)]
pub enum SweepExpiredUsageError {
    #[error("internal error: {0}")]
    Internal(String),
}

/// SweepExpiredUsageUseCase は保持期限を過ぎたカウンターを削除する。
/// 現在期間と直前期間のカウンターは保持期限内のため削除されない。
pub struct SweepExpiredUsageUseCase {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl SweepExpiredUsageUseCase {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn execute(&self) -> Result<u64, SweepExpiredUsageError> {
        let now = self.clock.now();
        let removed = self
            .store
            .sweep_expired(now)
            .await
            .map_err(|e| SweepExpiredUsageError::Internal(e.to_string()))?;
        if removed > 0 {
            tracing::info!(removed, "expired usage counters swept");
        }
        Ok(removed)
    }
}
