use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use super::period::ResetPolicy;

/// 認証されていない呼び出し元に割り当てる subject_id。
pub const ANONYMOUS_SUBJECT_ID: &str = "anonymous";

/// サービス全体の上限を表す合成 subject の subject_id と tier。
pub const GLOBAL_SUBJECT_ID: &str = "global";
pub const GLOBAL_TIER: &str = "global";

/// Subject はクォータを消費する主体（ユーザーまたはサービス全体）を表す。
/// ライフサイクルは持たず、リクエストごとに呼び出し元から渡される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: String,
    pub tier: String,
}

impl Subject {
    pub fn new(subject_id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            tier: tier.into(),
        }
    }

    /// global はサービス全体の上限に使う合成 subject を返す。
    pub fn global() -> Self {
        Self::new(GLOBAL_SUBJECT_ID, GLOBAL_TIER)
    }

    pub fn anonymous(tier: impl Into<String>) -> Self {
        Self::new(ANONYMOUS_SUBJECT_ID, tier)
    }

    pub fn is_global(&self) -> bool {
        self.subject_id == GLOBAL_SUBJECT_ID
    }
}

/// Limit は (service, tier, metric) に設定された上限値。
///
/// JSON では数値、または無制限の場合は文字列 `"unlimited"` として表現する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Limited(u64),
    Unlimited,
}

/// Remaining は残り枠。表現は Limit と同じ。
pub type Remaining = Limit;

impl Limit {
    pub fn value(&self) -> Option<u64> {
        match self {
            Limit::Limited(v) => Some(*v),
            Limit::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// parse は設定値の文字列表現（数値または "unlimited"）を解釈する。
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") {
            return Some(Limit::Unlimited);
        }
        trimmed.parse::<u64>().ok().map(Limit::Limited)
    }
}

impl Serialize for Limit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Limit::Limited(v) => serializer.serialize_u64(*v),
            Limit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// StoreFailureMode はカウンターストア障害時の振る舞いを明示的に選択する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureMode {
    /// リクエストを許可し、障害をエラーログに残す。
    FailOpen,
    /// リクエストを拒否し、コスト上限を保護する。
    #[default]
    FailClosed,
}

/// CounterKey は使用量カウンターを一意に識別する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub service: String,
    pub subject_id: String,
    pub metric: String,
    pub period_key: String,
}

impl CounterKey {
    pub fn new(
        service: impl Into<String>,
        subject_id: impl Into<String>,
        metric: impl Into<String>,
        period_key: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            subject_id: subject_id.into(),
            metric: metric.into(),
            period_key: period_key.into(),
        }
    }

    /// storage_key は外部ストア向けのフラットなキー文字列を返す。
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.service, self.subject_id, self.metric, self.period_key
        )
    }
}

/// UsageCounter はカウンターストアが保持する値。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounter {
    pub count: u64,
    pub last_updated: DateTime<Utc>,
    /// この時刻以降はスイープで削除してよい。None は削除しない。
    pub retain_until: Option<DateTime<Utc>>,
}

impl UsageCounter {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retain_until.is_some_and(|until| until <= now)
    }
}

/// Denial は拒否時の詳細。
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub metric: String,
    pub error_code: String,
    pub current: u64,
    pub limit: u64,
    pub requested: u64,
    pub period_key: String,
    /// 期間終了までの待ち時間。リセットされないメトリクスでは None。
    pub retry_after: Option<std::time::Duration>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Decision は tryConsume の結果。
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed {
        metric: String,
        current: u64,
        remaining: Remaining,
    },
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// MetricUsage は 1 メトリクス分の使用状況スナップショット。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricUsage {
    pub current: u64,
    pub limit: Limit,
    pub remaining: Remaining,
    pub percentage_used: f64,
    pub reset_policy: ResetPolicy,
    pub period_key: String,
    pub next_reset: Option<DateTime<Utc>>,
}

impl MetricUsage {
    pub fn new(
        current: u64,
        limit: Limit,
        reset_policy: ResetPolicy,
        period_key: String,
        next_reset: Option<DateTime<Utc>>,
    ) -> Self {
        let (remaining, percentage_used) = match limit {
            Limit::Unlimited => (Limit::Unlimited, 0.0),
            Limit::Limited(limit) => {
                let percent = if limit == 0 {
                    100.0
                } else {
                    (current as f64 / limit as f64) * 100.0
                };
                (Limit::Limited(limit.saturating_sub(current)), percent)
            }
        };
        Self {
            current,
            limit,
            remaining,
            percentage_used,
            reset_policy,
            period_key,
            next_reset,
        }
    }
}

/// UsageSnapshot はサービス内の全メトリクスについての subject の使用状況。
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub service: String,
    pub subject_id: String,
    pub tier: String,
    pub generated_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_parse() {
        assert_eq!(Limit::parse("10"), Some(Limit::Limited(10)));
        assert_eq!(Limit::parse(" unlimited "), Some(Limit::Unlimited));
        assert_eq!(Limit::parse("UNLIMITED"), Some(Limit::Unlimited));
        assert_eq!(Limit::parse("-1"), None);
        assert_eq!(Limit::parse("lots"), None);
    }

    #[test]
    fn test_limit_serialization() {
        assert_eq!(serde_json::to_value(Limit::Limited(5)).unwrap(), serde_json::json!(5));
        assert_eq!(
            serde_json::to_value(Limit::Unlimited).unwrap(),
            serde_json::json!("unlimited")
        );
    }

    #[test]
    fn test_counter_key_storage_key() {
        let key = CounterKey::new("ai_analysis", "user-1", "daily_analyses", "2024-03-15");
        assert_eq!(key.storage_key(), "ai_analysis:user-1:daily_analyses:2024-03-15");
    }

    #[test]
    fn test_global_subject() {
        let subject = Subject::global();
        assert!(subject.is_global());
        assert_eq!(subject.tier, GLOBAL_TIER);
        assert!(!Subject::anonymous("free").is_global());
    }

    #[test]
    fn test_metric_usage_under_limit() {
        let usage = MetricUsage::new(1, Limit::Limited(4), ResetPolicy::Daily, "k".into(), None);
        assert_eq!(usage.remaining, Limit::Limited(3));
        assert!((usage.percentage_used - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metric_usage_unlimited_reports_zero_percent() {
        let usage = MetricUsage::new(1000, Limit::Unlimited, ResetPolicy::Daily, "k".into(), None);
        assert_eq!(usage.remaining, Limit::Unlimited);
        assert_eq!(usage.percentage_used, 0.0);
    }

    #[test]
    fn test_metric_usage_zero_limit() {
        let usage = MetricUsage::new(0, Limit::Limited(0), ResetPolicy::Never, "k".into(), None);
        assert_eq!(usage.remaining, Limit::Limited(0));
        assert!((usage.percentage_used - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_usage_counter_expiry() {
        let now = Utc::now();
        let counter = UsageCounter {
            count: 1,
            last_updated: now,
            retain_until: Some(now),
        };
        assert!(counter.is_expired(now));
        let permanent = UsageCounter {
            retain_until: None,
            ..counter
        };
        assert!(!permanent.is_expired(now));
    }
}
