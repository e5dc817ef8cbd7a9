use std::collections::BTreeMap;

use super::period::ResetPolicy;
use super::quota::{Limit, GLOBAL_TIER};

/// PolicyError はクォータポリシーの参照・検証エラーを表す。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid reset policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown metric '{metric}' for service '{service}'")]
    UnknownMetric { service: String, metric: String },

    #[error("no limit configured for tier '{tier}' and metric '{metric}' in service '{service}'")]
    UnknownTierOrMetric {
        service: String,
        tier: String,
        metric: String,
    },

    #[error("invalid limit value: {0}")]
    InvalidLimit(String),

    #[error("invalid policy configuration: {0}")]
    Invalid(String),
}

/// MetricDefinition はサービス内で計測される量の定義。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    pub name: String,
    pub reset_policy: ResetPolicy,
    /// 拒否時に返す機械可読なエラーコード。
    pub error_code: String,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, reset_policy: ResetPolicy) -> Self {
        let name = name.into();
        let error_code = default_error_code(&name);
        Self {
            name,
            reset_policy,
            error_code,
        }
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = error_code.into();
        self
    }
}

fn default_error_code(metric: &str) -> String {
    format!("QUOTA_{}_EXCEEDED", metric.to_uppercase())
}

/// ServicePolicy は 1 サービス分のメトリクス定義と tier ごとの上限表。
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePolicy {
    pub name: String,
    pub alert_threshold_percent: Option<u8>,
    metrics: Vec<MetricDefinition>,
    /// tier -> metric -> limit
    limits: BTreeMap<String, BTreeMap<String, Limit>>,
}

impl ServicePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alert_threshold_percent: None,
            metrics: Vec::new(),
            limits: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, metric: MetricDefinition) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn with_limit(mut self, tier: &str, metric: &str, limit: Limit) -> Self {
        self.set_limit(tier, metric, limit);
        self
    }

    pub fn with_alert_threshold(mut self, percent: u8) -> Self {
        self.alert_threshold_percent = Some(percent);
        self
    }

    pub fn set_limit(&mut self, tier: &str, metric: &str, limit: Limit) {
        self.limits
            .entry(tier.to_string())
            .or_default()
            .insert(metric.to_string(), limit);
    }

    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    pub fn tiers(&self) -> impl Iterator<Item = &str> {
        self.limits.keys().map(String::as_str)
    }

    pub fn limits(&self) -> &BTreeMap<String, BTreeMap<String, Limit>> {
        &self.limits
    }

    pub fn metric(&self, name: &str) -> Result<&MetricDefinition, PolicyError> {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| PolicyError::UnknownMetric {
                service: self.name.clone(),
                metric: name.to_string(),
            })
    }

    pub fn limit_for(&self, tier: &str, metric: &str) -> Result<Limit, PolicyError> {
        self.limits
            .get(tier)
            .and_then(|m| m.get(metric))
            .copied()
            .ok_or_else(|| PolicyError::UnknownTierOrMetric {
                service: self.name.clone(),
                tier: tier.to_string(),
                metric: metric.to_string(),
            })
    }

    /// validate はすべての tier が全メトリクスの上限を持つことを確認する。
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.metrics.is_empty() {
            return Err(PolicyError::Invalid(format!(
                "service '{}' defines no metrics",
                self.name
            )));
        }
        if self.limits.is_empty() {
            return Err(PolicyError::Invalid(format!(
                "service '{}' defines no tiers",
                self.name
            )));
        }
        for (i, metric) in self.metrics.iter().enumerate() {
            if self.metrics[..i].iter().any(|m| m.name == metric.name) {
                return Err(PolicyError::Invalid(format!(
                    "duplicate metric '{}' in service '{}'",
                    metric.name, self.name
                )));
            }
        }
        if let Some(percent) = self.alert_threshold_percent {
            if percent == 0 || percent > 100 {
                return Err(PolicyError::Invalid(format!(
                    "alert_threshold_percent must be within 1..=100, got {}",
                    percent
                )));
            }
        }
        for (tier, limits) in &self.limits {
            for metric in &self.metrics {
                if !limits.contains_key(&metric.name) {
                    return Err(PolicyError::UnknownTierOrMetric {
                        service: self.name.clone(),
                        tier: tier.clone(),
                        metric: metric.name.clone(),
                    });
                }
            }
            for name in limits.keys() {
                self.metric(name)?;
            }
        }
        Ok(())
    }
}

/// QuotaPolicy は全サービスのポリシー表。起動時に構築・検証され、以降は変更されない。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaPolicy {
    services: BTreeMap<String, ServicePolicy>,
}

impl QuotaPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServicePolicy) -> Self {
        self.services.insert(service.name.clone(), service);
        self
    }

    pub fn services(&self) -> impl Iterator<Item = &ServicePolicy> {
        self.services.values()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, name: &str) -> Result<&ServicePolicy, PolicyError> {
        self.services
            .get(name)
            .ok_or_else(|| PolicyError::UnknownService(name.to_string()))
    }

    pub fn metric(&self, service: &str, metric: &str) -> Result<&MetricDefinition, PolicyError> {
        self.service(service)?.metric(metric)
    }

    pub fn limit_for(&self, service: &str, tier: &str, metric: &str) -> Result<Limit, PolicyError> {
        self.service(service)?.limit_for(tier, metric)
    }

    /// override_limit は既存の (service, tier, metric) の上限を置き換える。
    /// 起動時の環境変数による上書きにのみ使う。
    pub fn override_limit(
        &mut self,
        service: &str,
        tier: &str,
        metric: &str,
        limit: Limit,
    ) -> Result<(), PolicyError> {
        let svc = self
            .services
            .get_mut(service)
            .ok_or_else(|| PolicyError::UnknownService(service.to_string()))?;
        svc.metric(metric)?;
        svc.set_limit(tier, metric, limit);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.services.is_empty() {
            return Err(PolicyError::Invalid("no services configured".to_string()));
        }
        self.services.values().try_for_each(ServicePolicy::validate)
    }

    /// ai_analysis_defaults は AI 予算分析向けの既定ポリシーを返す。
    ///
    /// - daily_cost: サービス全体の 1 日あたりコスト上限（セント単位）
    /// - hourly_analyses: サービス全体の 1 時間あたり分析回数
    /// - daily_analyses: ユーザーごとの 1 日あたり分析回数
    pub fn ai_analysis_defaults(environment: &str) -> Self {
        let daily_cost_cents = match environment {
            "prod" | "production" => 2000,
            _ => 500,
        };
        let hourly_analyses = 10;
        let service = ServicePolicy::new(AI_ANALYSIS_SERVICE)
            .with_metric(
                MetricDefinition::new("daily_cost", ResetPolicy::Daily)
                    .with_error_code("DAILY_COST_LIMIT"),
            )
            .with_metric(
                MetricDefinition::new("hourly_analyses", ResetPolicy::Hourly)
                    .with_error_code("HOURLY_ANALYSIS_LIMIT"),
            )
            .with_metric(
                MetricDefinition::new("daily_analyses", ResetPolicy::Daily)
                    .with_error_code("USER_DAILY_LIMIT"),
            )
            .with_alert_threshold(80)
            .with_limit(GLOBAL_TIER, "daily_cost", Limit::Limited(daily_cost_cents))
            .with_limit(GLOBAL_TIER, "hourly_analyses", Limit::Limited(hourly_analyses))
            .with_limit(GLOBAL_TIER, "daily_analyses", Limit::Unlimited)
            .with_limit("free", "daily_cost", Limit::Unlimited)
            .with_limit("free", "hourly_analyses", Limit::Unlimited)
            .with_limit("free", "daily_analyses", Limit::Limited(3))
            .with_limit("pro", "daily_cost", Limit::Unlimited)
            .with_limit("pro", "hourly_analyses", Limit::Unlimited)
            .with_limit("pro", "daily_analyses", Limit::Limited(25))
            .with_limit("enterprise", "daily_cost", Limit::Unlimited)
            .with_limit("enterprise", "hourly_analyses", Limit::Unlimited)
            .with_limit("enterprise", "daily_analyses", Limit::Unlimited);
        Self::new().with_service(service)
    }
}

/// 既定ポリシーのサービス名。
pub const AI_ANALYSIS_SERVICE: &str = "ai_analysis";
