use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION, header::RETRY_AFTER},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tanda_core::{ContributionRecord, EngineError, PaymentDisplay, PayoutReceipt};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::accounts::AccountService;
use crate::accounts::types::{
    ChangeMfaMethodRequest, CodeRequest, MfaMethodChanged, Principal, RegisterRequest,
    SessionStarted, SessionVerified, StartSessionRequest,
};
use crate::config::Config;
use crate::invitations::InvitationService;
use crate::invitations::types::{
    AcceptedInvitation, CleanupReport, InvitationView, IssueInvitationRequest, IssuedInvitation,
    RejectInvitationRequest,
};
use crate::pools::PoolService;
use crate::pools::types::{
    ConfirmContributionRequest, CreatePoolRequest, PaymentDisplayQuery, PoolList, PoolView,
    ProcessPayoutRequest,
};

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    accounts: AccountService,
    pools: PoolService,
    invitations: InvitationService,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        accounts: AccountService,
        pools: PoolService,
        invitations: InvitationService,
    ) -> Self {
        Self {
            config: Arc::new(config),
            accounts,
            pools,
            invitations,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn pools(&self) -> &PoolService {
        &self.pools
    }

    pub fn invitations(&self) -> &InvitationService {
        &self.invitations
    }
}

pub fn build_router(state: AppState) -> Router {
    let session_state = state.clone();
    let internal_state = state.clone();
    let request_timeout = Duration::from_millis(state.config.request_timeout_ms);

    let public_router = Router::new()
        .route("/healthz", get(health))
        .route("/v1/accounts", post(register))
        .route("/v1/sessions", post(start_session))
        .route("/v1/sessions/mfa/verify", post(verify_session_mfa))
        .route("/v1/sessions/mfa/code", post(resend_mfa_code))
        .route("/v1/sessions/mfa/backup", post(use_backup_code))
        .route("/v1/invitations/:token", get(validate_invitation));

    let protected_router = Router::new()
        .route("/v1/accounts/mfa/method", post(change_mfa_method))
        .route("/v1/accounts/mfa/totp/confirm", post(confirm_totp_enrollment))
        .route("/v1/pools", get(list_pools).post(create_pool))
        .route("/v1/pools/:pool_id", get(get_pool))
        .route("/v1/pools/:pool_id/invitations", post(issue_invitation))
        .route("/v1/invitations/:token/accept", post(accept_invitation))
        .route("/v1/invitations/:token/reject", post(reject_invitation))
        .route("/v1/pools/:pool_id/contributions", post(confirm_contribution))
        .route(
            "/v1/pools/:pool_id/contributions/:member_id/verify",
            post(verify_contribution),
        )
        .route(
            "/v1/pools/:pool_id/contributions/:member_id/undo",
            post(undo_contribution),
        )
        .route("/v1/pools/:pool_id/payouts", post(process_payout))
        .route("/v1/pools/:pool_id/payment-display", get(payment_display))
        .route_layer(middleware::from_fn_with_state(
            session_state,
            verified_session_gate,
        ));

    let internal_router = Router::new()
        .route(
            "/internal/v1/invitations/cleanup",
            post(cleanup_invitations),
        )
        .route_layer(middleware::from_fn_with_state(
            internal_state,
            internal_token_gate,
        ));

    Router::new()
        .merge(public_router)
        .merge(protected_router)
        .merge(internal_router)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

/// Every mutating pool, invitation and settings call passes through here.
async fn verified_session_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return ApiError(EngineError::Unauthorized(
            "missing bearer session token".to_string(),
        ))
        .into_response();
    };
    match state.accounts.require_verified_session(&token).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(error) => ApiError(error).into_response(),
    }
}

async fn internal_token_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.internal_token.as_deref() else {
        return ApiError(EngineError::Forbidden(
            "internal routes are disabled".to_string(),
        ))
        .into_response();
    };
    match bearer_token(request.headers()) {
        Some(token) if token == expected => next.run(request).await,
        _ => ApiError(EngineError::Unauthorized(
            "invalid internal token".to_string(),
        ))
        .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionStarted>), ApiError> {
    let started = state.accounts.register(body).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionStarted>), ApiError> {
    let started = state.accounts.start_session(body).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn verify_session_mfa(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CodeRequest>,
) -> Result<Json<SessionVerified>, ApiError> {
    let token = require_bearer(&headers)?;
    let verified = state.accounts.verify_session_mfa(&token, &body.code).await?;
    Ok(Json(verified))
}

async fn resend_mfa_code(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = require_bearer(&headers)?;
    state.accounts.resend_code(&token).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn use_backup_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CodeRequest>,
) -> Result<Json<SessionVerified>, ApiError> {
    let token = require_bearer(&headers)?;
    let verified = state.accounts.use_backup_code(&token, &body.code).await?;
    Ok(Json(verified))
}

async fn change_mfa_method(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ChangeMfaMethodRequest>,
) -> Result<Json<MfaMethodChanged>, ApiError> {
    let changed = state.accounts.change_mfa_method(&principal, body).await?;
    Ok(Json(changed))
}

async fn confirm_totp_enrollment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CodeRequest>,
) -> Result<Json<SessionVerified>, ApiError> {
    let confirmed = state
        .accounts
        .confirm_totp_enrollment(&principal, &body.code)
        .await?;
    Ok(Json(confirmed))
}

async fn list_pools(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<PoolList>, ApiError> {
    Ok(Json(state.pools.pools_for_user(&principal).await?))
}

async fn create_pool(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreatePoolRequest>,
) -> Result<(StatusCode, Json<PoolView>), ApiError> {
    let pool = state.pools.create_pool(&principal, body).await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

async fn get_pool(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(pool_id): Path<String>,
) -> Result<Json<PoolView>, ApiError> {
    Ok(Json(state.pools.get_pool(&principal, &pool_id).await?))
}

async fn issue_invitation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(pool_id): Path<String>,
    Json(body): Json<IssueInvitationRequest>,
) -> Result<(StatusCode, Json<IssuedInvitation>), ApiError> {
    let issued = state.invitations.issue(&principal, &pool_id, body).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn validate_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<InvitationView>, ApiError> {
    Ok(Json(state.invitations.validate(&token).await?))
}

async fn accept_invitation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(token): Path<String>,
) -> Result<Json<AcceptedInvitation>, ApiError> {
    Ok(Json(state.invitations.accept(&principal, &token).await?))
}

async fn reject_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Option<Json<RejectInvitationRequest>>,
) -> Result<Json<InvitationView>, ApiError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.invitations.reject(&token, request).await?))
}

async fn confirm_contribution(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(pool_id): Path<String>,
    Json(body): Json<ConfirmContributionRequest>,
) -> Result<Json<ContributionRecord>, ApiError> {
    let record = state
        .pools
        .confirm_contribution(&principal, &pool_id, body)
        .await?;
    Ok(Json(record))
}

async fn verify_contribution(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((pool_id, member_id)): Path<(String, String)>,
) -> Result<Json<ContributionRecord>, ApiError> {
    let record = state
        .pools
        .verify_contribution(&principal, &pool_id, &member_id)
        .await?;
    Ok(Json(record))
}

async fn undo_contribution(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((pool_id, member_id)): Path<(String, String)>,
) -> Result<Json<ContributionRecord>, ApiError> {
    let record = state
        .pools
        .undo_contribution(&principal, &pool_id, &member_id)
        .await?;
    Ok(Json(record))
}

async fn process_payout(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(pool_id): Path<String>,
    Json(body): Json<ProcessPayoutRequest>,
) -> Result<Json<PayoutReceipt>, ApiError> {
    let receipt = state
        .pools
        .process_payout(&principal, &pool_id, body)
        .await?;
    Ok(Json(receipt))
}

async fn payment_display(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(pool_id): Path<String>,
    Query(query): Query<PaymentDisplayQuery>,
) -> Result<Json<PaymentDisplay>, ApiError> {
    let display = state
        .pools
        .payment_display(&principal, &pool_id, query)
        .await?;
    Ok(Json(display))
}

async fn cleanup_invitations(
    State(state): State<AppState>,
) -> Result<Json<CleanupReport>, ApiError> {
    Ok(Json(state.invitations.cleanup_expired().await?))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = authorization.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn require_bearer(headers: &HeaderMap) -> Result<String, ApiError> {
    bearer_token(headers).ok_or_else(|| {
        ApiError(EngineError::Unauthorized(
            "missing bearer session token".to_string(),
        ))
    })
}

#[derive(Debug)]
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation { .. } | EngineError::InvalidPaymentMethod(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Unauthorized(_) | EngineError::InvalidCode => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_)
            | EngineError::RoundMismatch { .. }
            | EngineError::AlreadyPaidOut { .. }
            | EngineError::ContributionsIncomplete { .. }
            | EngineError::PoolFull { .. }
            | EngineError::DuplicateMember { .. }
            | EngineError::DuplicateInvitation { .. }
            | EngineError::AlreadyResolved { .. }
            | EngineError::PoolCompleted
            | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EngineError::ExpiredInvitation | EngineError::ExpiredCode => StatusCode::GONE,
            EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self.0 {
            EngineError::RateLimited {
                retry_after_seconds,
            } => {
                let mut response = (
                    status,
                    Json(serde_json::json!({
                        "error": "rate_limited",
                        "message": "too many failed verification attempts",
                        "retry_after_seconds": retry_after_seconds,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
                response
            }
            EngineError::Validation { field, message } => (
                status,
                Json(serde_json::json!({
                    "error": "validation_error",
                    "field": field,
                    "message": message,
                })),
            )
                .into_response(),
            EngineError::StoreUnavailable(reason) | EngineError::Internal(reason) => {
                tracing::error!(status = status.as_u16(), %reason, "request failed");
                (
                    status,
                    Json(serde_json::json!({
                        "error": if status == StatusCode::SERVICE_UNAVAILABLE {
                            "store_unavailable"
                        } else {
                            "internal_error"
                        },
                        "message": "the request could not be completed, try again",
                    })),
                )
                    .into_response()
            }
            error => (
                status,
                Json(serde_json::json!({
                    "error": error.code(),
                    "message": error.to_string(),
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests;
