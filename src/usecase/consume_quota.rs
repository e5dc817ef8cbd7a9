use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::entity::policy::PolicyError;
use crate::domain::entity::quota::{Decision, Denial, Limit, Subject};
use crate::domain::repository::CounterStore;
use crate::domain::service::{Clock, QuotaResolver, ResolvedQuota};
use crate::infrastructure::event_publisher::{
    NoopQuotaEventPublisher, QuotaDeniedEvent, QuotaEventPublisher, QuotaThresholdReachedEvent,
};

use super::call_store;

#[derive(Debug, Clone)]
pub struct ConsumeQuotaInput {
    pub service: String,
    pub subject: Subject,
    pub metric: String,
    pub amount: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeQuotaError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),
}

/// ConsumeQuotaUseCase は「subject が metric を amount だけ今消費してよいか」を判定する。
///
/// 上限内なら加算して許可し、超過する場合はストアを変更せずに拒否する。
/// 判定と加算の原子性は CounterStore::check_and_increment が保証する。
pub struct ConsumeQuotaUseCase {
    resolver: QuotaResolver,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    event_publisher: Arc<dyn QuotaEventPublisher>,
    store_timeout: Duration,
}

impl ConsumeQuotaUseCase {
    pub fn new(
        resolver: QuotaResolver,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        event_publisher: Arc<dyn QuotaEventPublisher>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            store,
            clock,
            event_publisher,
            store_timeout,
        }
    }

    pub fn new_without_publisher(
        resolver: QuotaResolver,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self::new(
            resolver,
            store,
            clock,
            Arc::new(NoopQuotaEventPublisher),
            store_timeout,
        )
    }

    pub async fn execute(&self, input: &ConsumeQuotaInput) -> Result<Decision, ConsumeQuotaError> {
        validate_amount(input.amount)?;
        let now = self.clock.now();
        let resolved = self
            .resolver
            .resolve(&input.service, &input.subject, &input.metric, now)?;

        let limit = match resolved.limit {
            Limit::Unlimited => {
                let count = call_store(
                    "increment_and_get",
                    self.store_timeout,
                    self.store.increment_and_get(
                        &resolved.key,
                        input.amount,
                        resolved.retain_until,
                        now,
                    ),
                )
                .await
                .map_err(ConsumeQuotaError::StoreUnavailable)?;
                return Ok(Decision::Allowed {
                    metric: input.metric.clone(),
                    current: count,
                    remaining: Limit::Unlimited,
                });
            }
            Limit::Limited(limit) => limit,
        };

        let result = call_store(
            "check_and_increment",
            self.store_timeout,
            self.store.check_and_increment(
                &resolved.key,
                input.amount,
                limit,
                resolved.retain_until,
                now,
            ),
        )
        .await
        .map_err(ConsumeQuotaError::StoreUnavailable)?;

        if !result.allowed {
            let denial = build_denial(&resolved, result.count, limit, input.amount, now);
            info!(
                service = %input.service,
                subject_id = %input.subject.subject_id,
                metric = %input.metric,
                current = denial.current,
                limit = denial.limit,
                error_code = %denial.error_code,
                "quota request denied"
            );
            self.publish_denied(input, &denial, now).await;
            return Ok(Decision::Denied(denial));
        }

        self.maybe_publish_threshold(input, &resolved, result.count, limit, now)
            .await;

        Ok(Decision::Allowed {
            metric: input.metric.clone(),
            current: result.count,
            remaining: Limit::Limited(limit.saturating_sub(result.count)),
        })
    }

    /// check は加算を行わずに判定だけを返す。ストアは一切変更しない。
    ///
    /// 複数メトリクスをまとめて課金する前の事前確認に使う。
    /// 確定判定は必ず `execute` で行うこと。
    pub async fn check(&self, input: &ConsumeQuotaInput) -> Result<Decision, ConsumeQuotaError> {
        validate_amount(input.amount)?;
        let now = self.clock.now();
        let resolved = self
            .resolver
            .resolve(&input.service, &input.subject, &input.metric, now)?;
        let current = call_store(
            "get",
            self.store_timeout,
            self.store.get(&resolved.key),
        )
        .await
        .map_err(ConsumeQuotaError::StoreUnavailable)?;

        match resolved.limit {
            Limit::Unlimited => Ok(Decision::Allowed {
                metric: input.metric.clone(),
                current,
                remaining: Limit::Unlimited,
            }),
            Limit::Limited(limit) if current.saturating_add(input.amount) > limit => Ok(
                Decision::Denied(build_denial(&resolved, current, limit, input.amount, now)),
            ),
            Limit::Limited(limit) => Ok(Decision::Allowed {
                metric: input.metric.clone(),
                current,
                remaining: Limit::Limited(limit.saturating_sub(current)),
            }),
        }
    }

    async fn publish_denied(&self, input: &ConsumeQuotaInput, denial: &Denial, now: DateTime<Utc>) {
        let event = QuotaDeniedEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: "QUOTA_DENIED".to_string(),
            service: input.service.clone(),
            subject_id: input.subject.subject_id.clone(),
            tier: input.subject.tier.clone(),
            metric: denial.metric.clone(),
            error_code: denial.error_code.clone(),
            period_key: denial.period_key.clone(),
            limit: denial.limit,
            current: denial.current,
            requested: denial.requested,
            reset_at: denial.reset_at,
            denied_at: now,
        };
        if let Err(e) = self.event_publisher.publish_denied(&event).await {
            tracing::warn!(error = %e, "failed to publish quota denied event");
        }
    }

    /// 今回の加算で使用率がアラート閾値をまたいだ場合のみイベントを発行する。
    async fn maybe_publish_threshold(
        &self,
        input: &ConsumeQuotaInput,
        resolved: &ResolvedQuota,
        count: u64,
        limit: u64,
        now: DateTime<Utc>,
    ) {
        if limit == 0 {
            return;
        }
        let Ok(service) = self.resolver.policy().service(&input.service) else {
            return;
        };
        let Some(threshold) = service.alert_threshold_percent else {
            return;
        };
        let usage_percent = (count as f64 / limit as f64) * 100.0;
        let prev_percent = (count.saturating_sub(input.amount) as f64 / limit as f64) * 100.0;
        if usage_percent < threshold as f64 || prev_percent >= threshold as f64 {
            return;
        }

        let event = QuotaThresholdReachedEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: "QUOTA_THRESHOLD_REACHED".to_string(),
            service: input.service.clone(),
            subject_id: input.subject.subject_id.clone(),
            tier: input.subject.tier.clone(),
            metric: input.metric.clone(),
            period_key: resolved.key.period_key.clone(),
            limit,
            used: count,
            usage_percent,
            alert_threshold_percent: threshold,
            reached_at: now,
        };
        if let Err(e) = self.event_publisher.publish_threshold_reached(&event).await {
            tracing::warn!(error = %e, "failed to publish threshold reached event");
        }
    }
}

fn validate_amount(amount: u64) -> Result<(), ConsumeQuotaError> {
    if amount == 0 {
        return Err(ConsumeQuotaError::Validation(
            "amount must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn build_denial(
    resolved: &ResolvedQuota,
    current: u64,
    limit: u64,
    requested: u64,
    now: DateTime<Utc>,
) -> Denial {
    Denial {
        metric: resolved.metric.name.clone(),
        error_code: resolved.metric.error_code.clone(),
        current,
        limit,
        requested,
        period_key: resolved.key.period_key.clone(),
        retry_after: resolved
            .period_end
            .and_then(|end| (end - now).to_std().ok()),
        reset_at: resolved.period_end,
    }
}
