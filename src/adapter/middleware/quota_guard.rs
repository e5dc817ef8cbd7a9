use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::adapter::handler::error::{quota_exceeded_response, ApiError};
use crate::domain::entity::policy::{QuotaPolicy, AI_ANALYSIS_SERVICE};
use crate::domain::entity::quota::{Decision, StoreFailureMode, Subject};
use crate::infrastructure::telemetry::Metrics;
use crate::usecase::consume_quota::{ConsumeQuotaError, ConsumeQuotaInput};
use crate::usecase::ConsumeQuotaUseCase;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";
pub const DEFAULT_TIER: &str = "free";

/// AI 解析 1 回あたりに daily_cost へ課金する見積もりコスト。
pub const AI_ANALYSIS_COST_PER_REQUEST: u64 = 50;

/// ChargeScope は課金対象が呼び出し元かサービス全体かを表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeScope {
    /// サービス全体の上限（global サブジェクト）に課金する。
    Global,
    /// リクエストヘッダーから解決した呼び出し元に課金する。
    Caller,
}

#[derive(Debug, Clone)]
pub struct GuardCharge {
    pub scope: ChargeScope,
    pub metric: String,
    pub amount: u64,
}

impl GuardCharge {
    pub fn global(metric: impl Into<String>, amount: u64) -> Self {
        Self {
            scope: ChargeScope::Global,
            metric: metric.into(),
            amount,
        }
    }

    pub fn caller(metric: impl Into<String>, amount: u64) -> Self {
        Self {
            scope: ChargeScope::Caller,
            metric: metric.into(),
            amount,
        }
    }
}

/// QuotaGuardState は保護対象ルートに適用する課金リスト。
///
/// 課金はキーごとにアトミックだが、リスト全体としてはトランザクションではない。
/// 後続の課金が拒否されても、それまでに消費した課金は返却されない。
#[derive(Clone)]
pub struct QuotaGuardState {
    pub consume_uc: Arc<ConsumeQuotaUseCase>,
    pub service: String,
    pub charges: Vec<GuardCharge>,
    pub failure_mode: StoreFailureMode,
    pub metrics: Arc<Metrics>,
}

impl QuotaGuardState {
    /// ai_analysis は AI 解析ルート用のガードを組み立てる。
    /// グローバルの hourly_analyses と daily_cost、呼び出し元の daily_analyses に課金する。
    pub fn ai_analysis(
        consume_uc: Arc<ConsumeQuotaUseCase>,
        failure_mode: StoreFailureMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            consume_uc,
            service: AI_ANALYSIS_SERVICE.to_string(),
            charges: vec![
                GuardCharge::global("hourly_analyses", 1),
                GuardCharge::global("daily_cost", AI_ANALYSIS_COST_PER_REQUEST),
                GuardCharge::caller("daily_analyses", 1),
            ],
            failure_mode,
            metrics,
        }
    }

    /// covered_by は全課金の指標がポリシーに定義されているかを返す。
    pub fn covered_by(&self, policy: &QuotaPolicy) -> bool {
        self.charges
            .iter()
            .all(|charge| policy.metric(&self.service, &charge.metric).is_ok())
    }
}

/// caller_subject はヘッダーから呼び出し元を解決する。
/// x-user-id がなければ anonymous、x-user-tier がなければ free とみなす。
pub fn caller_subject(headers: &HeaderMap) -> Subject {
    let tier = header_str(headers, USER_TIER_HEADER).unwrap_or(DEFAULT_TIER);
    match header_str(headers, USER_ID_HEADER) {
        Some(id) => Subject::new(id, tier),
        None => Subject::anonymous(tier),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// quota_guard はハンドラー実行前にクォータを消費するミドルウェア。
///
/// まず全課金を読み取りのみで確認し、いずれかが超過していれば何も消費せずに 429 を返す。
/// 確認を通過した後は各課金を順に消費する。確認と消費の間に他リクエストが割り込んだ場合は
/// 後続の課金で拒否されることがあり、その時点までに消費した分は戻さない。
///
/// 解決した呼び出し元 Subject はリクエスト拡張に格納され、ハンドラーから参照できる。
pub async fn quota_guard(
    State(state): State<QuotaGuardState>,
    mut req: Request,
    next: Next,
) -> Response {
    let caller = caller_subject(req.headers());
    let inputs: Vec<ConsumeQuotaInput> = state
        .charges
        .iter()
        .map(|charge| ConsumeQuotaInput {
            service: state.service.clone(),
            subject: match charge.scope {
                ChargeScope::Global => Subject::global(),
                ChargeScope::Caller => caller.clone(),
            },
            metric: charge.metric.clone(),
            amount: charge.amount,
        })
        .collect();

    for input in &inputs {
        match state.consume_uc.check(input).await {
            Ok(Decision::Allowed { .. }) => {}
            Ok(Decision::Denied(denial)) => {
                state
                    .metrics
                    .record_decision(&state.service, &denial.metric, "denied");
                return quota_exceeded_response(&denial);
            }
            Err(e) => {
                if let Some(response) = handle_error(&state, input, e) {
                    return response;
                }
            }
        }
    }

    for input in &inputs {
        match state.consume_uc.execute(input).await {
            Ok(Decision::Allowed { .. }) => {
                state
                    .metrics
                    .record_decision(&state.service, &input.metric, "allowed");
            }
            Ok(Decision::Denied(denial)) => {
                state
                    .metrics
                    .record_decision(&state.service, &denial.metric, "denied");
                return quota_exceeded_response(&denial);
            }
            Err(e) => {
                if let Some(response) = handle_error(&state, input, e) {
                    return response;
                }
            }
        }
    }

    req.extensions_mut().insert(caller);
    next.run(req).await
}

/// handle_error はエラーを応答に変換する。fail_open でストア障害を許容する場合は None を返す。
fn handle_error(
    state: &QuotaGuardState,
    input: &ConsumeQuotaInput,
    err: ConsumeQuotaError,
) -> Option<Response> {
    match err {
        ConsumeQuotaError::StoreUnavailable(msg) => {
            state.metrics.record_store_error("guard");
            match state.failure_mode {
                StoreFailureMode::FailOpen => {
                    tracing::error!(
                        service = %state.service,
                        metric = %input.metric,
                        error = %msg,
                        "counter store unavailable, allowing request (fail_open)"
                    );
                    state
                        .metrics
                        .record_decision(&state.service, &input.metric, "fail_open");
                    None
                }
                StoreFailureMode::FailClosed => {
                    state
                        .metrics
                        .record_decision(&state.service, &input.metric, "fail_closed");
                    Some(ApiError::store_unavailable(msg).into_response())
                }
            }
        }
        // 課金リストとポリシーの不整合は設定ミスなので 500 とする。
        ConsumeQuotaError::Policy(e) => {
            tracing::error!(service = %state.service, error = %e, "quota guard misconfigured");
            Some(ApiError::internal(e.to_string()).into_response())
        }
        ConsumeQuotaError::Validation(msg) => {
            tracing::error!(service = %state.service, error = %msg, "quota guard misconfigured");
            Some(ApiError::internal(msg).into_response())
        }
    }
}
