use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::entity::quota::{CounterKey, UsageCounter};
use crate::domain::repository::{CheckAndIncrementResult, CounterStore};

/// InMemoryCounterStore は単一インスタンス向けのプロセス内カウンターストア。
///
/// 状態はプロセス再起動で失われる。複数インスタンス構成では RedisCounterStore を使う。
/// 確認と加算は 1 回の書き込みロック内で行うため、同一キーの判定は直列化される。
pub struct InMemoryCounterStore {
    counters: RwLock<HashMap<CounterKey, UsageCounter>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// 保持しているカウンター数を返す。
    pub async fn len(&self) -> usize {
        self.counters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.read().await.is_empty()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_increment(
    counters: &mut HashMap<CounterKey, UsageCounter>,
    key: &CounterKey,
    delta: u64,
    retain_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> u64 {
    let counter = counters.entry(key.clone()).or_insert(UsageCounter {
        count: 0,
        last_updated: now,
        retain_until,
    });
    counter.count = counter.count.saturating_add(delta);
    counter.last_updated = now;
    counter.retain_until = retain_until;
    counter.count
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &CounterKey) -> anyhow::Result<u64> {
        let counters = self.counters.read().await;
        Ok(counters.get(key).map(|c| c.count).unwrap_or(0))
    }

    async fn increment_and_get(
        &self,
        key: &CounterKey,
        delta: u64,
        retain_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut counters = self.counters.write().await;
        Ok(apply_increment(&mut counters, key, delta, retain_until, now))
    }

    async fn check_and_increment(
        &self,
        key: &CounterKey,
        amount: u64,
        limit: u64,
        retain_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CheckAndIncrementResult> {
        let mut counters = self.counters.write().await;
        let current = counters.get(key).map(|c| c.count).unwrap_or(0);
        if current.saturating_add(amount) > limit {
            return Ok(CheckAndIncrementResult {
                allowed: false,
                count: current,
            });
        }
        let count = apply_increment(&mut counters, key, amount, retain_until, now);
        Ok(CheckAndIncrementResult {
            allowed: true,
            count,
        })
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let candidates: Vec<CounterKey> = {
            let counters = self.counters.read().await;
            counters
                .iter()
                .filter(|(_, c)| c.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect()
        };

        // 書き込みロックはキー 1 件ごとに取得し、リクエスト処理を長時間ブロックしない
        let mut removed = 0u64;
        for key in candidates {
            let mut counters = self.counters.write().await;
            if counters.get(&key).is_some_and(|c| c.is_expired(now)) {
                counters.remove(&key);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
