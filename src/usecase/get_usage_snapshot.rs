use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::entity::policy::PolicyError;
use crate::domain::entity::quota::{MetricUsage, Subject, UsageSnapshot};
use crate::domain::repository::CounterStore;
use crate::domain::service::{Clock, QuotaResolver};

use super::call_store;

#[derive(Debug, thiserror::Error)]
pub enum GetUsageSnapshotError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),
}

/// GetUsageSnapshotUseCase は subject の全メトリクスの使用状況を読み取り専用で返す。
///
/// ConsumeQuotaUseCase と同じ QuotaResolver を使うため、同一時刻であれば
/// 参照するカウンターキーと上限は強制側と一致する。
pub struct GetUsageSnapshotUseCase {
    resolver: QuotaResolver,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl GetUsageSnapshotUseCase {
    pub fn new(
        resolver: QuotaResolver,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            store,
            clock,
            store_timeout,
        }
    }

    pub async fn execute(
        &self,
        service: &str,
        subject: &Subject,
    ) -> Result<UsageSnapshot, GetUsageSnapshotError> {
        let now = self.clock.now();
        let resolved = self.resolver.resolve_all(service, subject, now)?;

        let mut metrics = BTreeMap::new();
        for quota in resolved {
            let current = call_store("get", self.store_timeout, self.store.get(&quota.key))
                .await
                .map_err(GetUsageSnapshotError::StoreUnavailable)?;
            metrics.insert(
                quota.metric.name.clone(),
                MetricUsage::new(
                    current,
                    quota.limit,
                    quota.metric.reset_policy,
                    quota.key.period_key,
                    quota.period_end,
                ),
            );
        }

        Ok(UsageSnapshot {
            service: service.to_string(),
            subject_id: subject.subject_id.clone(),
            tier: subject.tier.clone(),
            generated_at: now,
            metrics,
        })
    }
}
