use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::error::{quota_exceeded_response, ApiError};
use super::AppState;
use crate::domain::entity::quota::{Decision, Limit, StoreFailureMode, Subject, ANONYMOUS_SUBJECT_ID};
use crate::usecase::consume_quota::{ConsumeQuotaError, ConsumeQuotaInput};
use crate::usecase::get_usage_snapshot::GetUsageSnapshotError;

/// POST /api/v1/quotas/:service/consume
pub async fn consume_quota(
    State(state): State<AppState>,
    Path(service): Path<String>,
    payload: Result<Json<ConsumeRequest>, JsonRejection>,
) -> Response {
    // 本文の不備も他の 4xx と同じエラー形式で返す。
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return ApiError::bad_request(rejection.body_text()).into_response(),
    };
    let input = ConsumeQuotaInput {
        service: service.clone(),
        subject: req.subject(),
        metric: req.metric.clone(),
        amount: req.amount,
    };

    match state.consume_uc.execute(&input).await {
        Ok(Decision::Allowed {
            metric,
            current,
            remaining,
        }) => {
            state.metrics.record_decision(&service, &metric, "allowed");
            (
                StatusCode::OK,
                Json(ConsumeResponse {
                    allowed: true,
                    metric,
                    current: Some(current),
                    remaining: Some(remaining),
                    degraded: false,
                }),
            )
                .into_response()
        }
        Ok(Decision::Denied(denial)) => {
            state.metrics.record_decision(&service, &denial.metric, "denied");
            quota_exceeded_response(&denial)
        }
        Err(ConsumeQuotaError::Validation(msg)) => ApiError::bad_request(msg).into_response(),
        Err(ConsumeQuotaError::Policy(e)) => ApiError::from(e).into_response(),
        Err(ConsumeQuotaError::StoreUnavailable(msg)) => {
            state.metrics.record_store_error("consume");
            match state.failure_mode {
                StoreFailureMode::FailOpen => {
                    tracing::error!(
                        service = %service,
                        metric = %req.metric,
                        error = %msg,
                        "counter store unavailable, allowing request (fail_open)"
                    );
                    state.metrics.record_decision(&service, &req.metric, "fail_open");
                    (
                        StatusCode::OK,
                        Json(ConsumeResponse {
                            allowed: true,
                            metric: req.metric,
                            current: None,
                            remaining: None,
                            degraded: true,
                        }),
                    )
                        .into_response()
                }
                StoreFailureMode::FailClosed => {
                    state.metrics.record_decision(&service, &req.metric, "fail_closed");
                    ApiError::store_unavailable(msg).into_response()
                }
            }
        }
    }
}

/// GET /api/v1/quotas/:service/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusResponse>, ApiError> {
    let subject = Subject::new(
        params
            .subject_id
            .unwrap_or_else(|| ANONYMOUS_SUBJECT_ID.to_string()),
        params.tier,
    );

    let snapshot = state
        .snapshot_uc
        .execute(&service, &subject)
        .await
        .map_err(|e| match e {
            GetUsageSnapshotError::Policy(e) => ApiError::from(e),
            GetUsageSnapshotError::StoreUnavailable(msg) => {
                state.metrics.record_store_error("snapshot");
                ApiError::store_unavailable(msg)
            }
        })?;

    let limits = snapshot
        .metrics
        .iter()
        .map(|(name, usage)| (name.clone(), usage.limit))
        .collect();

    Ok(Json(StatusResponse { snapshot, limits }))
}

/// POST /api/v1/ai_analysis/admit
/// quota_guard の課金を通過した呼び出し元を返す。
pub async fn admit_analysis(Extension(subject): Extension<Subject>) -> Json<AdmitResponse> {
    Json(AdmitResponse {
        admitted: true,
        subject_id: subject.subject_id,
        tier: subject.tier,
    })
}

/// GET /api/v1/quotas/:service/policy
pub async fn get_policy(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let svc = state.policy.service(&service)?;
    Ok(Json(PolicyResponse {
        service: svc.name.clone(),
        alert_threshold_percent: svc.alert_threshold_percent,
        metrics: svc
            .metrics()
            .iter()
            .map(|m| MetricResponse {
                name: m.name.clone(),
                reset_policy: m.reset_policy.as_str().to_string(),
                error_code: m.error_code.clone(),
            })
            .collect(),
        limits: svc.limits().clone(),
    }))
}

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub subject_id: Option<String>,
    pub tier: String,
    pub metric: String,
    #[serde(default = "default_amount")]
    pub amount: u64,
}

fn default_amount() -> u64 {
    1
}

impl ConsumeRequest {
    fn subject(&self) -> Subject {
        match &self.subject_id {
            Some(id) => Subject::new(id.clone(), self.tier.clone()),
            None => Subject::anonymous(self.tier.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub allowed: bool,
    pub metric: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<Limit>,
    /// ストア障害時に fail_open で許可した場合に true。
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct AdmitResponse {
    pub admitted: bool,
    pub subject_id: String,
    pub tier: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub subject_id: Option<String>,
    pub tier: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub snapshot: crate::domain::entity::quota::UsageSnapshot,
    pub limits: BTreeMap<String, Limit>,
}

#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold_percent: Option<u8>,
    pub metrics: Vec<MetricResponse>,
    pub limits: BTreeMap<String, BTreeMap<String, Limit>>,
}

#[derive(Debug, Serialize)]
pub struct MetricResponse {
    pub name: String,
    pub reset_policy: String,
    pub error_code: String,
}
