use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use super::AppState;

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// readyz はロード済みポリシーのサービス一覧とストア障害時の動作を返す。
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let services: Vec<&str> = state.policy.services().map(|s| s.name.as_str()).collect();
    Json(serde_json::json!({
        "status": "ready",
        "services": services,
        "store_failure_mode": state.failure_mode,
    }))
}
