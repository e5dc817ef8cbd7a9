use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing_subscriber::{
    fmt, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// TelemetryConfig はログ初期化の設定を保持する。
pub struct TelemetryConfig {
    pub service_name: String,
    pub environment: String,
    pub log_level: String,
    /// ログ出力フォーマット。"text" の場合はプレーンテキスト、それ以外は JSON。
    pub log_format: String,
}

/// init_telemetry は tracing-subscriber を初期化する。
/// RUST_LOG が設定されていればそちらを優先する。
pub fn init_telemetry(cfg: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", cfg.log_level, e))?;
    let registry = tracing_subscriber::registry().with(filter);

    if cfg.log_format == "text" {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    tracing::debug!(
        service = %cfg.service_name,
        environment = %cfg.environment,
        "telemetry initialized"
    );
    Ok(())
}

/// デフォルトのヒストグラムバケット。
const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics はクォータサーバーの Prometheus メトリクス。
pub struct Metrics {
    http_requests_total: IntCounterVec,
    http_request_duration: HistogramVec,
    quota_decisions_total: IntCounterVec,
    store_errors_total: IntCounterVec,
    sweep_removed_total: IntCounter,
    registry: Registry,
}

impl Metrics {
    /// new は Prometheus メトリクスを初期化して返す。
    /// service_name はメトリクスの service ラベルに使用される。
    pub fn new(service_name: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests")
                .const_label("service", service_name),
            &["method", "path", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Histogram of HTTP request latency",
            )
            .const_label("service", service_name)
            .buckets(DEFAULT_BUCKETS.to_vec()),
            &["method", "path"],
        )?;

        let quota_decisions_total = IntCounterVec::new(
            Opts::new("quota_decisions_total", "Total number of quota decisions")
                .const_label("service", service_name),
            &["quota_service", "metric", "outcome"],
        )?;

        let store_errors_total = IntCounterVec::new(
            Opts::new(
                "quota_store_errors_total",
                "Total number of counter store failures",
            )
            .const_label("service", service_name),
            &["operation"],
        )?;

        let sweep_removed_total = IntCounter::with_opts(
            Opts::new(
                "quota_sweep_removed_total",
                "Total number of expired usage counters removed by sweep",
            )
            .const_label("service", service_name),
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(quota_decisions_total.clone()))?;
        registry.register(Box::new(store_errors_total.clone()))?;
        registry.register(Box::new(sweep_removed_total.clone()))?;

        Ok(Self {
            http_requests_total,
            http_request_duration,
            quota_decisions_total,
            store_errors_total,
            sweep_removed_total,
            registry,
        })
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: &str) {
        self.http_requests_total
            .with_label_values(&[method, path, status])
            .inc();
    }

    pub fn record_http_duration(&self, method: &str, path: &str, duration_secs: f64) {
        self.http_request_duration
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// record_decision は outcome（allowed / denied / fail_open / fail_closed）ごとに計数する。
    pub fn record_decision(&self, quota_service: &str, metric: &str, outcome: &str) {
        self.quota_decisions_total
            .with_label_values(&[quota_service, metric, outcome])
            .inc();
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors_total.with_label_values(&[operation]).inc();
    }

    pub fn record_sweep_removed(&self, removed: u64) {
        self.sweep_removed_total.inc_by(removed);
    }

    /// gather_metrics は Prometheus テキストフォーマットでメトリクスを返す。
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
