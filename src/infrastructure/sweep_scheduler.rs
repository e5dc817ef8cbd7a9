use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::infrastructure::telemetry::Metrics;
use crate::usecase::SweepExpiredUsageUseCase;

/// parse_schedule は cron 式を検証してパースする。
pub fn parse_schedule(expr: &str) -> anyhow::Result<croner::Cron> {
    croner::Cron::from_str(expr)
        .map_err(|e| anyhow::anyhow!("invalid sweep schedule '{}': {}", expr, e))
}

/// next_run は `after` より後の次回実行時刻を返す。
pub fn next_run(cron: &croner::Cron, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(after, false).ok()
}

/// run_sweep_cron は cron 式に従って期限切れカウンターの掃除を繰り返す。
/// 式の検証は起動時に済ませておくこと（QuotaConfig::sweep_cron）。
/// 掃除の失敗はログに記録して次回に持ち越す。
pub async fn run_sweep_cron(
    cron: croner::Cron,
    sweep_uc: Arc<SweepExpiredUsageUseCase>,
    metrics: Arc<Metrics>,
) {
    loop {
        let now = Utc::now();
        let Some(fire_at) = next_run(&cron, &now) else {
            tracing::error!("no next sweep occurrence found, sweep task exiting");
            return;
        };

        let wait = (fire_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1));
        info!(
            next_run = %fire_at,
            wait_secs = wait.as_secs(),
            "sleeping until next usage sweep"
        );
        tokio::time::sleep(wait).await;

        match sweep_uc.execute().await {
            Ok(removed) => metrics.record_sweep_removed(removed),
            Err(e) => {
                metrics.record_store_error("sweep_expired");
                tracing::warn!(error = %e, "usage sweep failed");
            }
        }
    }
}
