/// usage quota REST API tests
/// ルーターとガードミドルウェアを tower::ServiceExt::oneshot で駆動し、HTTP 契約を検証する。
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::post;
use axum::{Extension, Router};
use chrono::{DateTime, TimeZone, Utc};
use k1s0_usage_quota_server::adapter::handler::{router, AppState};
use k1s0_usage_quota_server::adapter::middleware::quota_guard::{
    quota_guard, GuardCharge, QuotaGuardState,
};
use k1s0_usage_quota_server::domain::entity::{
    CounterKey, QuotaPolicy, StoreFailureMode, Subject,
};
use k1s0_usage_quota_server::domain::repository::{CheckAndIncrementResult, CounterStore};
use k1s0_usage_quota_server::domain::service::{ManualClock, QuotaResolver};
use k1s0_usage_quota_server::infrastructure::in_memory_store::InMemoryCounterStore;
use k1s0_usage_quota_server::infrastructure::telemetry::Metrics;
use k1s0_usage_quota_server::usecase::{ConsumeQuotaUseCase, GetUsageSnapshotUseCase};
use tower::ServiceExt;

/// 常に失敗するストア（接続断を模擬）
struct UnavailableStore;

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn get(&self, _key: &CounterKey) -> anyhow::Result<u64> {
        Err(anyhow::anyhow!("connection refused"))
    }

    async fn increment_and_get(
        &self,
        _key: &CounterKey,
        _delta: u64,
        _retain_until: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        Err(anyhow::anyhow!("connection refused"))
    }

    async fn check_and_increment(
        &self,
        _key: &CounterKey,
        _amount: u64,
        _limit: u64,
        _retain_until: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<CheckAndIncrementResult> {
        Err(anyhow::anyhow!("connection refused"))
    }

    async fn sweep_expired(&self, _now: DateTime<Utc>) -> anyhow::Result<u64> {
        Err(anyhow::anyhow!("connection refused"))
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 22, 0, 0).unwrap()
}

struct TestApp {
    state: AppState,
}

fn make_app(store: Arc<dyn CounterStore>, failure_mode: StoreFailureMode) -> TestApp {
    let policy = Arc::new(QuotaPolicy::ai_analysis_defaults("dev"));
    let clock = Arc::new(ManualClock::new(now()));
    let resolver = QuotaResolver::new(policy.clone());
    let timeout = Duration::from_secs(1);
    let state = AppState {
        consume_uc: Arc::new(ConsumeQuotaUseCase::new_without_publisher(
            resolver.clone(),
            store.clone(),
            clock.clone(),
            timeout,
        )),
        snapshot_uc: Arc::new(GetUsageSnapshotUseCase::new(
            resolver, store, clock, timeout,
        )),
        policy,
        failure_mode,
        metrics: Arc::new(Metrics::new("usage-quota-test").unwrap()),
    };
    TestApp { state }
}

fn in_memory_app() -> TestApp {
    make_app(
        Arc::new(InMemoryCounterStore::new()),
        StoreFailureMode::FailClosed,
    )
}

fn consume_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/quotas/ai_analysis/consume")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let app = router(in_memory_app().state);
    let req = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_readyz_lists_services() {
    let app = router(in_memory_app().state);
    let req = Request::builder()
        .uri("/readyz")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["services"][0], "ai_analysis");
    assert_eq!(json["store_failure_mode"], "fail_closed");
}

#[tokio::test]
async fn test_consume_allowed() {
    let app = router(in_memory_app().state);
    let resp = app
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses"
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["allowed"], true);
    assert_eq!(json["current"], 1);
    assert_eq!(json["remaining"], 2);
}

#[tokio::test]
async fn test_consume_denied_returns_429() {
    let app = router(in_memory_app().state);
    let body = serde_json::json!({
        "subject_id": "user-1",
        "tier": "free",
        "metric": "daily_analyses"
    });
    for _ in 0..3 {
        let resp = app.clone().oneshot(consume_request(body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = app.oneshot(consume_request(body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()[header::RETRY_AFTER], "7200");
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "USER_DAILY_LIMIT");
    assert_eq!(json["retry_after"], 7200);
    assert_eq!(json["current"], 3);
    assert_eq!(json["limit"], 3);
    assert_eq!(json["metric"], "daily_analyses");
    assert_eq!(json["reset_at"], "2024-03-16T00:00:00Z");
}

#[tokio::test]
async fn test_consume_unknown_metric_returns_404() {
    let app = router(in_memory_app().state);
    let resp = app
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "monthly_exports"
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "SYS_QUOTA_METRIC_NOT_FOUND");
    assert!(json["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_consume_unknown_service_returns_404() {
    let app = router(in_memory_app().state);
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/quotas/billing/consume")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"subject_id":"user-1","tier":"free","metric":"daily_analyses"}"#,
        ))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_consume_zero_amount_returns_400() {
    let app = router(in_memory_app().state);
    let resp = app
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses",
            "amount": 0
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "SYS_QUOTA_VALIDATION_FAILED");
}

#[tokio::test]
async fn test_consume_malformed_body_uses_error_envelope() {
    let app = router(in_memory_app().state);
    let resp = app
        .clone()
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses",
            "amount": -1
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "SYS_QUOTA_VALIDATION_FAILED");
    assert!(json["error"]["request_id"].is_string());

    // metric 欠落も同じ形式
    let resp = app
        .oneshot(consume_request(serde_json::json!({ "tier": "free" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "SYS_QUOTA_VALIDATION_FAILED");
}

#[tokio::test]
async fn test_consume_unknown_tier_returns_400() {
    let app = router(in_memory_app().state);
    let resp = app
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "gold",
            "metric": "daily_analyses"
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_consume_store_unavailable_fail_closed_returns_503() {
    let app = router(make_app(Arc::new(UnavailableStore), StoreFailureMode::FailClosed).state);
    let resp = app
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses"
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["error"]["code"], "SYS_QUOTA_STORE_UNAVAILABLE");
}

#[tokio::test]
async fn test_consume_store_unavailable_fail_open_allows() {
    let app = router(make_app(Arc::new(UnavailableStore), StoreFailureMode::FailOpen).state);
    let resp = app
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses"
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["allowed"], true);
    assert_eq!(json["degraded"], true);
}

#[tokio::test]
async fn test_status_reports_usage_and_limits() {
    let app = router(in_memory_app().state);
    app.clone()
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses"
        })))
        .await
        .unwrap();

    let req = Request::builder()
        .uri("/api/v1/quotas/ai_analysis/status?subject_id=user-1&tier=free")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;

    assert_eq!(json["subject_id"], "user-1");
    let usage = &json["metrics"]["daily_analyses"];
    assert_eq!(usage["current"], 1);
    assert_eq!(usage["limit"], 3);
    assert_eq!(usage["remaining"], 2);
    assert_eq!(usage["next_reset"], "2024-03-16T00:00:00Z");
    assert_eq!(json["metrics"]["daily_cost"]["limit"], "unlimited");
    assert_eq!(json["metrics"]["daily_cost"]["percentage_used"], 0.0);
    assert_eq!(json["limits"]["daily_analyses"], 3);
}

#[tokio::test]
async fn test_policy_endpoint() {
    let app = router(in_memory_app().state);
    let req = Request::builder()
        .uri("/api/v1/quotas/ai_analysis/policy")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["limits"]["global"]["daily_cost"], 500);
    assert_eq!(json["limits"]["enterprise"]["daily_analyses"], "unlimited");
    assert_eq!(json["alert_threshold_percent"], 80);
}

#[tokio::test]
async fn test_metrics_endpoint_records_decisions() {
    let app = router(in_memory_app().state);
    app.clone()
        .oneshot(consume_request(serde_json::json!({
            "subject_id": "user-1",
            "tier": "free",
            "metric": "daily_analyses"
        })))
        .await
        .unwrap();

    let req = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("quota_decisions_total"));
    assert!(text.contains("outcome=\"allowed\""));
    assert!(text.contains("path=\"/api/v1/quotas/:service/consume\""));
}

// --- quota_guard middleware ---

async fn analyze(Extension(subject): Extension<Subject>) -> String {
    subject.subject_id
}

fn guarded_app(app: &TestApp) -> Router {
    let guard = QuotaGuardState {
        consume_uc: app.state.consume_uc.clone(),
        service: "ai_analysis".to_string(),
        charges: vec![
            GuardCharge::global("hourly_analyses", 1),
            GuardCharge::global("daily_cost", 50),
            GuardCharge::caller("daily_analyses", 1),
        ],
        failure_mode: app.state.failure_mode,
        metrics: app.state.metrics.clone(),
    };
    Router::new()
        .route("/analyze", post(analyze))
        .layer(axum::middleware::from_fn_with_state(guard, quota_guard))
}

fn analyze_request(user: Option<&str>, tier: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("x-user-tier", tier);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_guard_passes_caller_to_handler() {
    let guarded = guarded_app(&in_memory_app());
    let resp = guarded
        .oneshot(analyze_request(Some("user-7"), "pro"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"user-7");
}

#[tokio::test]
async fn test_guard_denies_after_user_daily_limit() {
    let app = in_memory_app();
    let guarded = guarded_app(&app);
    for _ in 0..3 {
        let resp = guarded
            .clone()
            .oneshot(analyze_request(Some("user-1"), "free"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = guarded
        .oneshot(analyze_request(Some("user-1"), "free"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "USER_DAILY_LIMIT");

    // 事前確認で拒否されたため、グローバル課金は 3 回分のまま
    let snapshot = app
        .state
        .snapshot_uc
        .execute("ai_analysis", &Subject::global())
        .await
        .unwrap();
    assert_eq!(snapshot.metrics["hourly_analyses"].current, 3);
    assert_eq!(snapshot.metrics["daily_cost"].current, 150);
}

#[tokio::test]
async fn test_guard_global_hourly_cap_applies_across_callers() {
    let guarded = guarded_app(&in_memory_app());
    for i in 0..10 {
        let user = format!("user-{}", i);
        let resp = guarded
            .clone()
            .oneshot(analyze_request(Some(&user), "enterprise"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = guarded
        .oneshot(analyze_request(Some("user-99"), "enterprise"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "HOURLY_ANALYSIS_LIMIT");
}

#[tokio::test]
async fn test_guard_anonymous_caller_shares_bucket() {
    let guarded = guarded_app(&in_memory_app());
    for _ in 0..3 {
        let resp = guarded
            .clone()
            .oneshot(analyze_request(None, "free"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = guarded.oneshot(analyze_request(None, "free")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_guard_does_not_refund_earlier_charges() {
    // 各課金の事前確認は個別に通るが、2 回目の daily_analyses 消費で上限を超える
    let app = in_memory_app();
    let guard = QuotaGuardState {
        consume_uc: app.state.consume_uc.clone(),
        service: "ai_analysis".to_string(),
        charges: vec![
            GuardCharge::global("hourly_analyses", 1),
            GuardCharge::caller("daily_analyses", 2),
            GuardCharge::caller("daily_analyses", 2),
        ],
        failure_mode: app.state.failure_mode,
        metrics: app.state.metrics.clone(),
    };
    let guarded = Router::new()
        .route("/analyze", post(analyze))
        .layer(axum::middleware::from_fn_with_state(guard, quota_guard));

    let resp = guarded
        .oneshot(analyze_request(Some("user-1"), "free"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let global = app
        .state
        .snapshot_uc
        .execute("ai_analysis", &Subject::global())
        .await
        .unwrap();
    assert_eq!(global.metrics["hourly_analyses"].current, 1);
    let caller = app
        .state
        .snapshot_uc
        .execute("ai_analysis", &Subject::new("user-1", "free"))
        .await
        .unwrap();
    assert_eq!(caller.metrics["daily_analyses"].current, 2);
}

#[tokio::test]
async fn test_guard_fail_closed_returns_503() {
    let guarded = guarded_app(&make_app(
        Arc::new(UnavailableStore),
        StoreFailureMode::FailClosed,
    ));
    let resp = guarded
        .oneshot(analyze_request(Some("user-1"), "free"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_guard_fail_open_reaches_handler() {
    let guarded = guarded_app(&make_app(
        Arc::new(UnavailableStore),
        StoreFailureMode::FailOpen,
    ));
    let resp = guarded
        .oneshot(analyze_request(Some("user-1"), "free"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// --- router に組み込まれた AI 解析受付ルート ---

fn admit_request(user: &str, tier: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/ai_analysis/admit")
        .header("x-user-id", user)
        .header("x-user-tier", tier)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_admit_route_is_guarded() {
    let app = in_memory_app();
    let svc = router(app.state.clone());
    for _ in 0..3 {
        let resp = svc
            .clone()
            .oneshot(admit_request("user-1", "free"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["admitted"], true);
        assert_eq!(json["subject_id"], "user-1");
        assert_eq!(json["tier"], "free");
    }

    let resp = svc.oneshot(admit_request("user-1", "free")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(resp).await;
    assert_eq!(json["error_code"], "USER_DAILY_LIMIT");

    let snapshot = app
        .state
        .snapshot_uc
        .execute("ai_analysis", &Subject::global())
        .await
        .unwrap();
    assert_eq!(snapshot.metrics["hourly_analyses"].current, 3);
    assert_eq!(snapshot.metrics["daily_cost"].current, 150);
}

#[tokio::test]
async fn test_admit_route_absent_without_ai_analysis_policy() {
    let app = in_memory_app();
    let mut state = app.state.clone();
    state.policy = Arc::new(QuotaPolicy::new());
    let resp = router(state)
        .oneshot(admit_request("user-1", "free"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
