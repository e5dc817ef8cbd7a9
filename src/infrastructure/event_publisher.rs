use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

/// QuotaDeniedEvent はクォータ拒否時に発行するイベント。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaDeniedEvent {
    pub event_id: String,
    pub event_type: String,
    pub service: String,
    pub subject_id: String,
    pub tier: String,
    pub metric: String,
    pub error_code: String,
    pub period_key: String,
    pub limit: u64,
    pub current: u64,
    pub requested: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub denied_at: DateTime<Utc>,
}

/// QuotaThresholdReachedEvent は使用率がアラート閾値を初めて超えたときに発行するイベント。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaThresholdReachedEvent {
    pub event_id: String,
    pub event_type: String,
    pub service: String,
    pub subject_id: String,
    pub tier: String,
    pub metric: String,
    pub period_key: String,
    pub limit: u64,
    pub used: u64,
    pub usage_percent: f64,
    pub alert_threshold_percent: u8,
    pub reached_at: DateTime<Utc>,
}

/// QuotaEventPublisher はクォータイベント配信のためのトレイト。
/// 配信の失敗は呼び出し側で記録して無視され、強制判定には影響しない。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaEventPublisher: Send + Sync {
    async fn publish_denied(&self, event: &QuotaDeniedEvent) -> anyhow::Result<()>;
    async fn publish_threshold_reached(
        &self,
        event: &QuotaThresholdReachedEvent,
    ) -> anyhow::Result<()>;
}

/// NoopQuotaEventPublisher は何もしないデフォルト実装。
pub struct NoopQuotaEventPublisher;

#[async_trait]
impl QuotaEventPublisher for NoopQuotaEventPublisher {
    async fn publish_denied(&self, _event: &QuotaDeniedEvent) -> anyhow::Result<()> {
        tracing::debug!("NoopQuotaEventPublisher: quota denied event discarded");
        Ok(())
    }

    async fn publish_threshold_reached(
        &self,
        _event: &QuotaThresholdReachedEvent,
    ) -> anyhow::Result<()> {
        tracing::debug!("NoopQuotaEventPublisher: threshold reached event discarded");
        Ok(())
    }
}

/// LoggingQuotaEventPublisher はイベントを構造化ログとして出力する。
/// 拒否は想定内の結果なので info レベルで記録する。
pub struct LoggingQuotaEventPublisher;

#[async_trait]
impl QuotaEventPublisher for LoggingQuotaEventPublisher {
    async fn publish_denied(&self, event: &QuotaDeniedEvent) -> anyhow::Result<()> {
        tracing::info!(
            event_type = %event.event_type,
            service = %event.service,
            subject_id = %event.subject_id,
            metric = %event.metric,
            error_code = %event.error_code,
            current = event.current,
            limit = event.limit,
            "quota denied"
        );
        Ok(())
    }

    async fn publish_threshold_reached(
        &self,
        event: &QuotaThresholdReachedEvent,
    ) -> anyhow::Result<()> {
        tracing::warn!(
            event_type = %event.event_type,
            service = %event.service,
            subject_id = %event.subject_id,
            metric = %event.metric,
            usage_percent = event.usage_percent,
            threshold = event.alert_threshold_percent,
            "quota alert threshold reached"
        );
        Ok(())
    }
}

/// RedisQuotaEventPublisher は Redis Pub/Sub チャンネルへ JSON イベントを発行する。
pub struct RedisQuotaEventPublisher {
    conn: ConnectionManager,
    channel: String,
}

impl RedisQuotaEventPublisher {
    pub fn new(conn: ConnectionManager, channel: String) -> Self {
        Self { conn, channel }
    }

    async fn publish_json<T: Serialize + Sync>(&self, event: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("failed to publish quota event: {}", e))?;
        tracing::debug!(channel = %self.channel, receivers, "quota event published");
        Ok(())
    }
}

#[async_trait]
impl QuotaEventPublisher for RedisQuotaEventPublisher {
    async fn publish_denied(&self, event: &QuotaDeniedEvent) -> anyhow::Result<()> {
        self.publish_json(event).await
    }

    async fn publish_threshold_reached(
        &self,
        event: &QuotaThresholdReachedEvent,
    ) -> anyhow::Result<()> {
        self.publish_json(event).await
    }
}
