use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::entity::policy::PolicyError;
use crate::domain::entity::quota::Denial;

/// ErrorBody は構造化エラーのペイロード。
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: String,
}

/// ErrorResponse は ErrorBody を `{ "error": ... }` で包む。
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                request_id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}

/// ApiError は HTTP ステータスへ写像されるハンドラーエラー。
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400 Bad Request
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    /// 404 Not Found
    #[error("{message}")]
    NotFound { code: &'static str, message: String },

    /// 500 Internal Server Error
    #[error("{message}")]
    Internal { code: &'static str, message: String },

    /// 503 Service Unavailable
    #[error("{message}")]
    ServiceUnavailable { code: &'static str, message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: "SYS_QUOTA_VALIDATION_FAILED",
            message: message.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            code: "SYS_QUOTA_STORE_UNAVAILABLE",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "SYS_QUOTA_INTERNAL_ERROR",
            message: message.into(),
        }
    }

    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest { code, .. } => (StatusCode::BAD_REQUEST, *code),
            Self::NotFound { code, .. } => (StatusCode::NOT_FOUND, *code),
            Self::Internal { code, .. } => (StatusCode::INTERNAL_SERVER_ERROR, *code),
            Self::ServiceUnavailable { code, .. } => (StatusCode::SERVICE_UNAVAILABLE, *code),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        let message = e.to_string();
        match e {
            PolicyError::UnknownService(_) => Self::NotFound {
                code: "SYS_QUOTA_SERVICE_NOT_FOUND",
                message,
            },
            PolicyError::UnknownMetric { .. } => Self::NotFound {
                code: "SYS_QUOTA_METRIC_NOT_FOUND",
                message,
            },
            PolicyError::UnknownTierOrMetric { .. } => Self::BadRequest {
                code: "SYS_QUOTA_UNKNOWN_TIER",
                message,
            },
            _ => Self::Internal {
                code: "SYS_QUOTA_POLICY_INVALID",
                message,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = ErrorResponse::new(code, &self.to_string());
        (status, Json(body)).into_response()
    }
}

/// QuotaExceededResponse は 429 応答のボディ。
#[derive(Debug, Clone, Serialize)]
pub struct QuotaExceededResponse {
    pub error_code: String,
    pub message: String,
    /// 次の期間開始までの秒数。リセットしないメトリクスでは null。
    pub retry_after: Option<u64>,
    pub current: u64,
    pub limit: u64,
    pub metric: String,
    pub reset_at: Option<DateTime<Utc>>,
}

impl From<&Denial> for QuotaExceededResponse {
    fn from(denial: &Denial) -> Self {
        Self {
            error_code: denial.error_code.clone(),
            message: format!(
                "quota exceeded for '{}': {} of {} used, {} requested",
                denial.metric, denial.current, denial.limit, denial.requested
            ),
            retry_after: denial.retry_after.map(ceil_secs),
            current: denial.current,
            limit: denial.limit,
            metric: denial.metric.clone(),
            reset_at: denial.reset_at,
        }
    }
}

fn ceil_secs(d: std::time::Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}

/// quota_exceeded_response は拒否判定を 429 応答に変換する。
/// 期間リセットがある場合は Retry-After ヘッダーを付与する。
pub fn quota_exceeded_response(denial: &Denial) -> Response {
    let body = QuotaExceededResponse::from(denial);
    let retry_after = body.retry_after;
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
