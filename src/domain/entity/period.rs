use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Timelike, Utc};
use serde::Serialize;

use super::policy::PolicyError;

/// リセットされないカウンターに割り当てる固定の期間キー。
pub const PERMANENT_PERIOD_KEY: &str = "permanent";

/// ResetPolicy はメトリクスのカウンターがリセットされる周期を表す。
///
/// 期間の境界はすべて UTC で計算する。リセットは明示的なゼロ化ではなく、
/// 新しい期間キーへ切り替わることで自然に発生する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    Hourly,
    Daily,
    Monthly,
    Never,
}

impl ResetPolicy {
    pub fn as_str(&self) -> &str {
        match self {
            ResetPolicy::Hourly => "hourly",
            ResetPolicy::Daily => "daily",
            ResetPolicy::Monthly => "monthly",
            ResetPolicy::Never => "never",
        }
    }

    /// period_key は `now` が属するリセット期間を識別する文字列を返す。
    /// 同じ期間に属する 2 つの時刻は必ず同じキーになり、異なる期間なら必ず異なるキーになる。
    pub fn period_key(&self, now: DateTime<Utc>) -> String {
        match self {
            ResetPolicy::Hourly => now.format("%Y-%m-%dT%H").to_string(),
            ResetPolicy::Daily => now.format("%Y-%m-%d").to_string(),
            ResetPolicy::Monthly => now.format("%Y-%m").to_string(),
            ResetPolicy::Never => PERMANENT_PERIOD_KEY.to_string(),
        }
    }

    /// period_start は現在の期間の開始時刻を返す。`Never` は None。
    pub fn period_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = now.date_naive();
        let start = match self {
            ResetPolicy::Hourly => date.and_hms_opt(now.hour(), 0, 0)?,
            ResetPolicy::Daily => date.and_hms_opt(0, 0, 0)?,
            ResetPolicy::Monthly => date.with_day(1)?.and_hms_opt(0, 0, 0)?,
            ResetPolicy::Never => return None,
        };
        Some(Utc.from_utc_datetime(&start))
    }

    /// period_end は現在の期間が終わる時刻（次の期間の最初の瞬間）を返す。
    /// `Never` は期限を持たないため None。
    pub fn period_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = self.period_start(now)?;
        match self {
            ResetPolicy::Hourly => Some(start + Duration::hours(1)),
            ResetPolicy::Daily => Some(start + Duration::days(1)),
            ResetPolicy::Monthly => start.checked_add_months(Months::new(1)),
            ResetPolicy::Never => None,
        }
    }

    /// retain_until は期間終了後さらに 1 期間分を保持した時刻を返す。
    /// この時刻を過ぎたカウンターはスイープ対象になる。
    pub fn retain_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let end = self.period_end(now)?;
        self.period_end(end)
    }
}

impl FromStr for ResetPolicy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(ResetPolicy::Hourly),
            "daily" => Ok(ResetPolicy::Daily),
            "monthly" => Ok(ResetPolicy::Monthly),
            "never" => Ok(ResetPolicy::Never),
            other => Err(PolicyError::InvalidPolicy(other.to_string())),
        }
    }
}

impl std::fmt::Display for ResetPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
