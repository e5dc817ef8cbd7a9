use std::net::SocketAddr;
use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use k1s0_usage_quota_server::adapter::handler::{router, AppState};
use k1s0_usage_quota_server::domain::repository::CounterStore;
use k1s0_usage_quota_server::domain::service::{Clock, QuotaResolver, SystemClock};
use k1s0_usage_quota_server::infrastructure::config::Config;
use k1s0_usage_quota_server::infrastructure::event_publisher::{
    LoggingQuotaEventPublisher, QuotaEventPublisher, RedisQuotaEventPublisher,
};
use k1s0_usage_quota_server::infrastructure::in_memory_store::InMemoryCounterStore;
use k1s0_usage_quota_server::infrastructure::redis_store::RedisCounterStore;
use k1s0_usage_quota_server::infrastructure::sweep_scheduler::run_sweep_cron;
use k1s0_usage_quota_server::infrastructure::telemetry::{init_telemetry, Metrics, TelemetryConfig};
use k1s0_usage_quota_server::usecase::{
    ConsumeQuotaUseCase, GetUsageSnapshotUseCase, SweepExpiredUsageUseCase,
};

const SERVICE_NAME: &str = "k1s0-usage-quota-server";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let cfg = Config::load(&config_path)?;

    init_telemetry(&TelemetryConfig {
        service_name: SERVICE_NAME.to_string(),
        environment: cfg.app.environment.clone(),
        log_level: cfg.observability.log_level.clone(),
        log_format: cfg.observability.log_format.clone(),
    })?;

    info!(
        app_name = %cfg.app.name,
        version = %cfg.app.version,
        environment = %cfg.app.environment,
        "starting usage quota server"
    );

    // 掃除スケジュールは起動時に検証し、不正なら起動を中止する。
    let sweep_cron = cfg.quota.sweep_cron()?;
    info!(schedule = %cfg.quota.sweep_schedule, "usage sweep schedule accepted");

    // ポリシーは起動時に一度だけ構築し、以後は不変。
    let policy = Arc::new(
        cfg.quota
            .build_policy(&cfg.app.environment, std::env::vars())?,
    );
    for service in policy.services() {
        info!(
            service = %service.name,
            metrics = service.metrics().len(),
            "quota policy loaded"
        );
    }

    // --- Counter store: Redis → InMemory fallback ---
    let redis_conn: Option<redis::aio::ConnectionManager> = if let Some(ref redis_cfg) = cfg.redis
    {
        info!(url = %redis_cfg.url, "connecting to Redis for usage counters");
        match redis::Client::open(redis_cfg.url.as_str()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(cm) => {
                    info!("Redis connection established for usage counters");
                    Some(cm)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to connect to Redis, will fall back");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid Redis URL, will fall back");
                None
            }
        }
    } else {
        None
    };

    let (store, event_publisher): (Arc<dyn CounterStore>, Arc<dyn QuotaEventPublisher>) =
        match (redis_conn, cfg.redis.as_ref()) {
            (Some(cm), Some(redis_cfg)) => {
                info!(prefix = %redis_cfg.key_prefix, "using Redis for usage counters");
                let store: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(
                    cm.clone(),
                    redis_cfg.key_prefix.clone(),
                ));
                let publisher: Arc<dyn QuotaEventPublisher> = match redis_cfg.event_channel {
                    Some(ref channel) => {
                        info!(channel = %channel, "publishing quota events to Redis");
                        Arc::new(RedisQuotaEventPublisher::new(cm, channel.clone()))
                    }
                    None => Arc::new(LoggingQuotaEventPublisher),
                };
                (store, publisher)
            }
            _ => {
                info!("using in-memory usage counters (state is lost on restart)");
                (
                    Arc::new(InMemoryCounterStore::new()),
                    Arc::new(LoggingQuotaEventPublisher),
                )
            }
        };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let resolver = QuotaResolver::new(policy.clone());
    let store_timeout = cfg.quota.store_timeout();

    let consume_uc = Arc::new(ConsumeQuotaUseCase::new(
        resolver.clone(),
        store.clone(),
        clock.clone(),
        event_publisher,
        store_timeout,
    ));
    let snapshot_uc = Arc::new(GetUsageSnapshotUseCase::new(
        resolver,
        store.clone(),
        clock.clone(),
        store_timeout,
    ));
    let sweep_uc = Arc::new(SweepExpiredUsageUseCase::new(store, clock));

    let metrics = Arc::new(Metrics::new(SERVICE_NAME)?);

    // Expired usage sweep cron
    {
        let cron_metrics = metrics.clone();
        tokio::spawn(async move {
            run_sweep_cron(sweep_cron, sweep_uc, cron_metrics).await;
        });
    }

    let state = AppState {
        consume_uc,
        snapshot_uc,
        policy,
        failure_mode: cfg.quota.store_failure_mode,
        metrics,
    };
    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!("REST server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("usage quota server stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
