use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::entity::policy::{MetricDefinition, PolicyError, QuotaPolicy};
use crate::domain::entity::quota::{CounterKey, Limit, Subject};

/// ResolvedQuota はある時刻における (service, subject, metric) の解決結果。
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuota {
    pub key: CounterKey,
    pub metric: MetricDefinition,
    pub limit: Limit,
    pub period_end: Option<DateTime<Utc>>,
    pub retain_until: Option<DateTime<Utc>>,
}

/// QuotaResolver は期間キーと上限の解決を一箇所にまとめるドメインサービス。
///
/// 強制（ConsumeQuota）と報告（GetUsageSnapshot）の両方がこれを経由するため、
/// 同じ時刻・同じキーに対して両者のバケットと上限は必ず一致する。
#[derive(Debug, Clone)]
pub struct QuotaResolver {
    policy: Arc<QuotaPolicy>,
}

impl QuotaResolver {
    pub fn new(policy: Arc<QuotaPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn resolve(
        &self,
        service: &str,
        subject: &Subject,
        metric: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedQuota, PolicyError> {
        let definition = self.policy.metric(service, metric)?;
        self.build(service, subject, definition, now)
    }

    /// resolve_all はサービスに定義された全メトリクスを定義順に解決する。
    pub fn resolve_all(
        &self,
        service: &str,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResolvedQuota>, PolicyError> {
        let svc = self.policy.service(service)?;
        svc.metrics()
            .iter()
            .map(|definition| self.build(service, subject, definition, now))
            .collect()
    }

    fn build(
        &self,
        service: &str,
        subject: &Subject,
        definition: &MetricDefinition,
        now: DateTime<Utc>,
    ) -> Result<ResolvedQuota, PolicyError> {
        let limit = self
            .policy
            .limit_for(service, &subject.tier, &definition.name)?;
        let policy = definition.reset_policy;
        Ok(ResolvedQuota {
            key: CounterKey::new(
                service,
                subject.subject_id.clone(),
                definition.name.clone(),
                policy.period_key(now),
            ),
            metric: definition.clone(),
            limit,
            period_end: policy.period_end(now),
            retain_until: policy.retain_until(now),
        })
    }
}
