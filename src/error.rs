//! The error kinds the core distinguishes, mapped to HTTP status and a
//! stable reason string at the gateway boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("no bearer token")]
    MissingCredential,
    #[error("invalid token format")]
    InvalidTokenFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    TokenExpired,
    #[error("token revoked")]
    TokenRevoked,
    #[error("account inactive")]
    AccountInactive,
    #[error("challenge not found")]
    ChallengeNotFound,
    #[error("{0}")]
    CeremonyVerificationFailed(String),
    #[error("cloned authenticator suspected")]
    CounterRegressed,
    #[error("{0}")]
    BadRequest(String),
    #[error("database error: {0}")]
    Unavailable(String),
}

impl AuthorityError {
    fn status(&self) -> StatusCode {
        match self {
            AuthorityError::MissingCredential
            | AuthorityError::InvalidTokenFormat
            | AuthorityError::InvalidSignature
            | AuthorityError::TokenExpired
            | AuthorityError::TokenRevoked
            | AuthorityError::AccountInactive => StatusCode::UNAUTHORIZED,
            AuthorityError::ChallengeNotFound
            | AuthorityError::CeremonyVerificationFailed(_)
            | AuthorityError::CounterRegressed
            | AuthorityError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AuthorityError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The stable reason string surfaced in error bodies. Never leaks
    /// internal grant-store structure (§7 propagation policy).
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<rusqlite::Error> for AuthorityError {
    fn from(e: rusqlite::Error) -> Self {
        AuthorityError::Unavailable(e.to_string())
    }
}

impl IntoResponse for AuthorityError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.reason() }))).into_response()
    }
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;
