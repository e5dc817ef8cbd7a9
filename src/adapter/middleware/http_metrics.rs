use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::infrastructure::telemetry::Metrics;

/// track_http_metrics は HTTP リクエスト数とレイテンシを記録するミドルウェア。
/// path ラベルにはルート定義（例: `/api/v1/quotas/:service/consume`）を使い、カーディナリティを抑える。
pub async fn track_http_metrics(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics.record_http_request(&method, &path, &status);
    metrics.record_http_duration(&method, &path, start.elapsed().as_secs_f64());
    response
}
