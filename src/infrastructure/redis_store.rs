use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;

use crate::domain::entity::quota::CounterKey;
use crate::domain::repository::{CheckAndIncrementResult, CounterStore};

/// CHECK_AND_INCREMENT_SCRIPT は上限判定と加算をアトミックに行う Lua スクリプト。
///
/// KEYS[1]: カウンターキー
/// ARGV[1]: 加算量 (amount)
/// ARGV[2]: 上限 (limit)
/// ARGV[3]: 保持期限 (Unix epoch seconds, 0 は期限なし)
///
/// Returns: {allowed (0/1), count}
const CHECK_AND_INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local amount = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local expire_at = tonumber(ARGV[3])

local current = tonumber(redis.call('GET', key) or '0')
if current + amount > limit then
    return {0, current}
end

local updated = redis.call('INCRBY', key, amount)
if expire_at > 0 then
    redis.call('EXPIREAT', key, expire_at)
end

return {1, updated}
"#;

/// INCREMENT_SCRIPT は無条件の加算と保持期限の設定を行う Lua スクリプト。
///
/// KEYS[1]: カウンターキー
/// ARGV[1]: 加算量 (delta)
/// ARGV[2]: 保持期限 (Unix epoch seconds, 0 は期限なし)
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local delta = tonumber(ARGV[1])
local expire_at = tonumber(ARGV[2])

local updated = redis.call('INCRBY', key, delta)
if expire_at > 0 then
    redis.call('EXPIREAT', key, expire_at)
end

return updated
"#;

/// RedisCounterStore は Redis ベースのカウンターストア。
///
/// 複数インスタンスで状態を共有する。期限切れカウンターの削除は
/// EXPIREAT により Redis 側で行われるため、`sweep_expired` は何もしない。
pub struct RedisCounterStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager, key_prefix: String) -> Self {
        Self { conn, key_prefix }
    }

    fn make_key(&self, key: &CounterKey) -> String {
        build_key(&self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &CounterKey) -> anyhow::Result<u64> {
        let key = self.make_key(key);
        let mut conn = self.conn.clone();
        let result: Option<u64> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(result.unwrap_or(0))
    }

    async fn increment_and_get(
        &self,
        key: &CounterKey,
        delta: u64,
        retain_until: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let script = Script::new(INCREMENT_SCRIPT);
        let updated: u64 = script
            .key(self.make_key(key))
            .arg(delta)
            .arg(expire_at_arg(retain_until))
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(updated)
    }

    async fn check_and_increment(
        &self,
        key: &CounterKey,
        amount: u64,
        limit: u64,
        retain_until: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<CheckAndIncrementResult> {
        let script = Script::new(CHECK_AND_INCREMENT_SCRIPT);
        let result: Vec<u64> = script
            .key(self.make_key(key))
            .arg(amount)
            .arg(limit)
            .arg(expire_at_arg(retain_until))
            .invoke_async(&mut self.conn.clone())
            .await?;

        if result.len() < 2 {
            return Err(anyhow::anyhow!("unexpected Lua script result"));
        }

        Ok(CheckAndIncrementResult {
            allowed: result[0] == 1,
            count: result[1],
        })
    }

    async fn sweep_expired(&self, _now: DateTime<Utc>) -> anyhow::Result<u64> {
        tracing::debug!("RedisCounterStore: expiry is handled by Redis TTL, nothing to sweep");
        Ok(0)
    }
}

/// キープレフィックスとカウンターキーから Redis キーを生成するヘルパー。
fn build_key(prefix: &str, key: &CounterKey) -> String {
    format!("{}{}", prefix, key.storage_key())
}

fn expire_at_arg(retain_until: Option<DateTime<Utc>>) -> i64 {
    retain_until.map(|t| t.timestamp()).unwrap_or(0)
}
