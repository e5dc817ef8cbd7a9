pub mod error;
pub mod health;
pub mod quota_handler;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

use crate::adapter::middleware::http_metrics::track_http_metrics;
use crate::adapter::middleware::quota_guard::{quota_guard, QuotaGuardState};
use crate::domain::entity::policy::QuotaPolicy;
use crate::domain::entity::quota::StoreFailureMode;
use crate::infrastructure::telemetry::Metrics;
use crate::usecase::{ConsumeQuotaUseCase, GetUsageSnapshotUseCase};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub consume_uc: Arc<ConsumeQuotaUseCase>,
    pub snapshot_uc: Arc<GetUsageSnapshotUseCase>,
    pub policy: Arc<QuotaPolicy>,
    pub failure_mode: StoreFailureMode,
    pub metrics: Arc<Metrics>,
}

/// ガード付き AI 解析受付ルート。
pub const AI_ANALYSIS_ADMIT_PATH: &str = "/api/v1/ai_analysis/admit";

/// Build the REST API router.
///
/// ポリシーに ai_analysis の課金指標が揃っている場合のみ、受付ルートを quota_guard 付きで公開する。
pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let guard = QuotaGuardState::ai_analysis(
        state.consume_uc.clone(),
        state.failure_mode,
        state.metrics.clone(),
    );
    let mut routes = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/v1/quotas/:service/consume",
            post(quota_handler::consume_quota),
        )
        .route(
            "/api/v1/quotas/:service/status",
            get(quota_handler::get_status),
        )
        .route(
            "/api/v1/quotas/:service/policy",
            get(quota_handler::get_policy),
        );
    if guard.covered_by(&state.policy) {
        routes = routes.route(
            AI_ANALYSIS_ADMIT_PATH,
            post(quota_handler::admit_analysis)
                .layer(axum::middleware::from_fn_with_state(guard, quota_guard)),
        );
    }
    routes
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            metrics,
            track_http_metrics,
        ))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
