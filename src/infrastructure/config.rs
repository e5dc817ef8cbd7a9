use std::collections::BTreeMap;

use serde::Deserialize;

use crate::domain::entity::period::ResetPolicy;
use crate::domain::entity::policy::{MetricDefinition, PolicyError, QuotaPolicy, ServicePolicy};
use crate::domain::entity::quota::{Limit, StoreFailureMode};
use crate::infrastructure::sweep_scheduler::parse_schedule;

/// 上限を環境変数で上書きする際のプレフィックス。
/// 形式: `QUOTA_LIMIT__<SERVICE>__<TIER>__<METRIC>=<n|unlimited>`
pub const LIMIT_OVERRIDE_PREFIX: &str = "QUOTA_LIMIT__";

/// Application configuration for usage quota server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(content)?;
        cfg.quota.sweep_cron()?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8098
}

/// RedisConfig は Redis 接続の設定を表す。
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// 設定するとクォータイベントをこのチャンネルへ PUBLISH する。
    #[serde(default)]
    pub event_channel: Option<String>,
}

fn default_key_prefix() -> String {
    "usage-quota:".to_string()
}

/// ObservabilityConfig はログ出力の設定を表す。
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// QuotaConfig はクォータ管理固有の設定を表す。
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub store_failure_mode: StoreFailureMode,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_sweep_schedule")]
    pub sweep_schedule: String,
    /// 空の場合は app.environment に応じた ai_analysis の既定ポリシーを使う。
    #[serde(default)]
    pub services: Vec<ServicePolicyConfig>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            store_failure_mode: StoreFailureMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            sweep_schedule: default_sweep_schedule(),
            services: Vec::new(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_sweep_schedule() -> String {
    "0 * * * *".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePolicyConfig {
    pub name: String,
    #[serde(default)]
    pub alert_threshold_percent: Option<u8>,
    pub metrics: Vec<MetricConfig>,
    /// tier -> metric -> limit
    pub limits: BTreeMap<String, BTreeMap<String, LimitValue>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    pub reset: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// LimitValue は YAML 上の上限値。数値または "unlimited"。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LimitValue {
    Count(u64),
    Keyword(String),
}

impl LimitValue {
    fn to_limit(&self) -> Result<Limit, PolicyError> {
        match self {
            LimitValue::Count(v) => Ok(Limit::Limited(*v)),
            LimitValue::Keyword(s) => {
                Limit::parse(s).ok_or_else(|| PolicyError::InvalidLimit(s.clone()))
            }
        }
    }
}

impl QuotaConfig {
    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms)
    }

    /// sweep_cron は掃除スケジュールをパースする。不正な式は起動エラーにする。
    pub fn sweep_cron(&self) -> anyhow::Result<croner::Cron> {
        parse_schedule(&self.sweep_schedule)
    }

    /// build_policy は設定からポリシー表を構築し、環境変数の上書きを適用して検証する。
    /// 返されたポリシーはプロセスの生存期間中変更されない。
    pub fn build_policy<I>(&self, environment: &str, env_vars: I) -> Result<QuotaPolicy, PolicyError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut policy = if self.services.is_empty() {
            QuotaPolicy::ai_analysis_defaults(environment)
        } else {
            self.services
                .iter()
                .try_fold(QuotaPolicy::new(), |policy, svc| {
                    Ok::<_, PolicyError>(policy.with_service(svc.to_service_policy()?))
                })?
        };
        apply_limit_overrides(&mut policy, env_vars)?;
        policy.validate()?;
        Ok(policy)
    }
}

impl ServicePolicyConfig {
    fn to_service_policy(&self) -> Result<ServicePolicy, PolicyError> {
        let mut service = ServicePolicy::new(&self.name);
        if let Some(percent) = self.alert_threshold_percent {
            service = service.with_alert_threshold(percent);
        }
        for metric in &self.metrics {
            let reset: ResetPolicy = metric.reset.parse()?;
            let mut definition = MetricDefinition::new(&metric.name, reset);
            if let Some(ref code) = metric.error_code {
                definition = definition.with_error_code(code);
            }
            service = service.with_metric(definition);
        }
        for (tier, limits) in &self.limits {
            for (metric, value) in limits {
                service.set_limit(tier, metric, value.to_limit()?);
            }
        }
        Ok(service)
    }
}

/// apply_limit_overrides は `QUOTA_LIMIT__` で始まる変数で上限を置き換える。
fn apply_limit_overrides<I>(policy: &mut QuotaPolicy, env_vars: I) -> Result<(), PolicyError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, value) in env_vars {
        let Some(rest) = name.strip_prefix(LIMIT_OVERRIDE_PREFIX) else {
            continue;
        };
        let parts: Vec<String> = rest.split("__").map(|p| p.to_lowercase()).collect();
        let [service, tier, metric] = parts.as_slice() else {
            return Err(PolicyError::Invalid(format!(
                "malformed limit override variable: {}",
                name
            )));
        };
        let limit = Limit::parse(&value).ok_or_else(|| PolicyError::InvalidLimit(value.clone()))?;
        policy.override_limit(service, tier, metric, limit)?;
        tracing::info!(
            service = %service,
            tier = %tier,
            metric = %metric,
            limit = %value,
            "quota limit overridden from environment"
        );
    }
    Ok(())
}
