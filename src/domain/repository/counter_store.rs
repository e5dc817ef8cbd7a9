use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entity::quota::CounterKey;

/// CheckAndIncrementResult はアトミックな確認と加算の結果。
///
/// `allowed` が false の場合、カウンターは変更されておらず `count` は現在値を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckAndIncrementResult {
    pub allowed: bool,
    pub count: u64,
}

/// CounterStore は使用量カウンターを保持する唯一の共有可変リソース。
///
/// 同一キーへの並行な更新の直列化はストア実装の責務であり、
/// 呼び出し側はロックを保持しない。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 現在値を返す。未作成のキーは 0。
    async fn get(&self, key: &CounterKey) -> anyhow::Result<u64>;

    /// `delta` を無条件に加算し、加算後の値を返す。
    async fn increment_and_get(
        &self,
        key: &CounterKey,
        delta: u64,
        retain_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// `current + amount <= limit` の場合のみ加算する。判定と加算はキー単位でアトミック。
    async fn check_and_increment(
        &self,
        key: &CounterKey,
        amount: u64,
        limit: u64,
        retain_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CheckAndIncrementResult>;

    /// 保持期限を過ぎたカウンターを削除し、削除件数を返す。
    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}
