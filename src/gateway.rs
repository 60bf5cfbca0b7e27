//! Request gateway (§4.6) — the REST surface of §6. Extracts and
//! validates bearer tokens for protected routes, dispatches to the
//! ceremony and authorization engines, and serializes responses. Fails
//! closed: any unexpected error on an authn/authz path becomes 401/500,
//! never a default allow.

use crate::authz::{AuthzEngine, CheckRequest};
use crate::db::Db;
use crate::error::{AuthorityError, AuthorityResult};
use crate::token::{self, Claims, TokenService};
use crate::webauthn::{self, AuthenticateCompleteRequest, RegisterCompleteRequest, RelyingParty};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub tokens: Arc<TokenService>,
    pub rp: Arc<RelyingParty>,
    pub session_lifetime: chrono::Duration,
    pub challenge_lifetime: chrono::Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/register/begin", post(register_begin))
        .route("/auth/register/complete", post(register_complete))
        .route("/auth/login/begin", post(login_begin))
        .route("/auth/login/complete", post(login_complete))
        .route("/auth/session", get(session))
        .route("/auth/logout", post(logout))
        .route("/authz/check", get(authz_check))
        .route("/authz/permissions", get(authz_permissions))
        .route("/authz/evaluate", post(authz_evaluate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Authenticate the request's bearer token. Never returns a subject on
/// any failure path — the gateway's fail-closed posture (§4.6). Touches
/// the session's `lastActivityAt` on every successful validation, per the
/// Session entity's lifecycle (§3).
fn authenticate(state: &AppState, headers: &HeaderMap) -> AuthorityResult<Claims> {
    let header_value = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let bearer = token::extract_bearer(header_value).ok_or(AuthorityError::MissingCredential)?;
    let claims = state.tokens.validate(bearer, &state.db, false)?;
    state.db.touch_session_activity(&claims.jti)?;
    Ok(claims)
}

// ─── Registration ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterBeginBody {
    email: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Serialize)]
struct CeremonyOptionsBody {
    #[serde(rename = "challengeId")]
    challenge_id: String,
    #[serde(rename = "optionsJson")]
    options_json: String,
}

async fn register_begin(
    State(state): State<AppState>,
    Json(body): Json<RegisterBeginBody>,
) -> AuthorityResult<Json<CeremonyOptionsBody>> {
    if body.email.trim().is_empty() || body.display_name.trim().is_empty() {
        return Err(AuthorityError::BadRequest("email and displayName are required".into()));
    }
    let options = webauthn::begin_registration(
        &state.db,
        &state.rp,
        state.challenge_lifetime,
        &body.email,
        &body.display_name,
    )?;
    Ok(Json(CeremonyOptionsBody { challenge_id: options.challenge_id, options_json: options.options_json }))
}

#[derive(Deserialize)]
struct RegisterCompleteBody {
    #[serde(rename = "challengeId")]
    challenge_id: String,
    #[serde(rename = "credentialId")]
    credential_id: String,
    #[serde(rename = "attestationObject")]
    attestation_object: String,
    #[serde(rename = "clientDataJson")]
    client_data_json: String,
    #[serde(rename = "deviceName")]
    device_name: Option<String>,
}

#[derive(Serialize)]
struct SessionBody {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct RegisterCompleteResponse {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "credentialId")]
    credential_id: String,
    session: SessionBody,
}

async fn register_complete(
    State(state): State<AppState>,
    Json(body): Json<RegisterCompleteBody>,
) -> AuthorityResult<Json<RegisterCompleteResponse>> {
    let result = webauthn::complete_registration(
        &state.db,
        &state.rp,
        &state.tokens,
        state.session_lifetime,
        state.challenge_lifetime,
        &RegisterCompleteRequest {
            challenge_id: &body.challenge_id,
            credential_id: &body.credential_id,
            attestation_object: &body.attestation_object,
            client_data_json: &body.client_data_json,
            device_name: body.device_name.as_deref(),
        },
    )?;
    tracing::info!(user_id = %result.user_id, credential_id = %result.credential_id, "registration complete");
    Ok(Json(RegisterCompleteResponse {
        user_id: result.user_id,
        credential_id: result.credential_id,
        session: SessionBody { token: result.session.token, expires_at: result.session.expires_at },
    }))
}

// ─── Authentication ─────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct LoginBeginBody {
    #[allow(dead_code)]
    email: Option<String>,
}

async fn login_begin(
    State(state): State<AppState>,
    body: Option<Json<LoginBeginBody>>,
) -> AuthorityResult<Json<CeremonyOptionsBody>> {
    let _ = body;
    let options = webauthn::begin_authentication(&state.db, &state.rp, state.challenge_lifetime)?;
    Ok(Json(CeremonyOptionsBody { challenge_id: options.challenge_id, options_json: options.options_json }))
}

#[derive(Deserialize)]
struct LoginCompleteBody {
    #[serde(rename = "challengeId")]
    challenge_id: String,
    #[serde(rename = "credentialId")]
    credential_id: String,
    #[serde(rename = "authenticatorData")]
    authenticator_data: String,
    #[serde(rename = "clientDataJson")]
    client_data_json: String,
    signature: String,
    #[serde(rename = "userHandle")]
    user_handle: Option<String>,
}

#[derive(Serialize)]
struct LoginCompleteResponse {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    session: SessionBody,
}

async fn login_complete(
    State(state): State<AppState>,
    Json(body): Json<LoginCompleteBody>,
) -> AuthorityResult<Json<LoginCompleteResponse>> {
    let result = webauthn::complete_authentication(
        &state.db,
        &state.rp,
        &state.tokens,
        state.session_lifetime,
        state.challenge_lifetime,
        &AuthenticateCompleteRequest {
            challenge_id: &body.challenge_id,
            credential_id: &body.credential_id,
            authenticator_data: &body.authenticator_data,
            client_data_json: &body.client_data_json,
            signature: &body.signature,
            user_handle: body.user_handle.as_deref(),
        },
    )?;
    tracing::info!(user_id = %result.user_id, "authentication complete");
    Ok(Json(LoginCompleteResponse {
        user_id: result.user_id,
        display_name: result.display_name,
        session: SessionBody { token: result.session.token, expires_at: result.session.expires_at },
    }))
}

// ─── Session & logout ───────────────────────────────────────────────────

#[derive(Serialize)]
struct SessionInfoBody {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    email: Option<String>,
    roles: Vec<String>,
    #[serde(rename = "expiresAt")]
    expires_at: chrono::DateTime<chrono::Utc>,
}

async fn session(State(state): State<AppState>, headers: HeaderMap) -> AuthorityResult<Json<SessionInfoBody>> {
    let claims = authenticate(&state, &headers)?;
    Ok(Json(SessionInfoBody {
        user_id: claims.sub,
        display_name: claims.display_name,
        email: claims.email,
        roles: claims.roles,
        expires_at: token::exp_to_datetime(claims.exp),
    }))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AuthorityResult<StatusCode> {
    let claims = authenticate(&state, &headers)?;
    state.tokens.revoke(&state.db, &claims.jti)?;
    tracing::info!(jti = %claims.jti, "session revoked");
    Ok(StatusCode::NO_CONTENT)
}

// ─── Authorization ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CheckQuery {
    permission: Option<String>,
    #[serde(rename = "resourceType")]
    resource_type: Option<String>,
    #[serde(rename = "resourceId")]
    resource_id: Option<String>,
}

#[derive(Serialize)]
struct DecisionBody {
    allowed: bool,
    reason: String,
}

async fn authz_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CheckQuery>,
) -> AuthorityResult<Json<DecisionBody>> {
    let claims = authenticate(&state, &headers)?;
    let permission = query
        .permission
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AuthorityError::BadRequest("missing permission query parameter".into()))?;

    let engine = AuthzEngine::new(&state.db);
    let decision = engine.check(
        &claims.sub,
        &CheckRequest {
            permission: &permission,
            resource_type: query.resource_type.as_deref(),
            resource_id: query.resource_id.as_deref(),
        },
    )?;
    Ok(Json(DecisionBody { allowed: decision.allowed, reason: decision.reason }))
}

#[derive(Serialize)]
struct PermissionsBody {
    permissions: Vec<crate::authz::EffectivePermission>,
}

async fn authz_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AuthorityResult<Json<PermissionsBody>> {
    let claims = authenticate(&state, &headers)?;
    let engine = AuthzEngine::new(&state.db);
    let permissions = engine.effective_permissions(&claims.sub)?;
    Ok(Json(PermissionsBody { permissions }))
}

#[derive(Deserialize)]
struct EvaluateCheck {
    permission: String,
    #[serde(rename = "resourceType")]
    resource_type: Option<String>,
    #[serde(rename = "resourceId")]
    resource_id: Option<String>,
}

#[derive(Deserialize)]
struct EvaluateBody {
    checks: Vec<EvaluateCheck>,
}

#[derive(Serialize)]
struct EvaluateResultBody {
    permission: String,
    #[serde(rename = "resourceId", skip_serializing_if = "Option::is_none")]
    resource_id: Option<String>,
    allowed: bool,
}

#[derive(Serialize)]
struct EvaluateResponseBody {
    results: Vec<EvaluateResultBody>,
}

async fn authz_evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EvaluateBody>,
) -> AuthorityResult<Json<EvaluateResponseBody>> {
    let claims = authenticate(&state, &headers)?;
    let checks: Vec<CheckRequest> = body
        .checks
        .iter()
        .map(|c| CheckRequest {
            permission: &c.permission,
            resource_type: c.resource_type.as_deref(),
            resource_id: c.resource_id.as_deref(),
        })
        .collect();

    let engine = AuthzEngine::new(&state.db);
    let decisions = engine.evaluate_bulk(&claims.sub, &checks)?;

    let results = body
        .checks
        .iter()
        .zip(decisions.iter())
        .map(|(check, decision)| EvaluateResultBody {
            permission: check.permission.clone(),
            resource_id: check.resource_id.clone(),
            allowed: decision.allowed,
        })
        .collect();
    Ok(Json(EvaluateResponseBody { results }))
}
