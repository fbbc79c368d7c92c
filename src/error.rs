use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::auth::session::SessionRejection;
use crate::presence::lifecycle::ConnectionState;
use crate::store::StoreError;

/// Errors surfaced by the presence core.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Session missing, expired, or without an identity at connect time.
    #[error("session invalid: {0}")]
    SessionInvalid(SessionRejection),

    /// The identity store could not be reached or rejected the operation.
    #[error("identity store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Targeted delivery for an identity with no live connection.
    #[error("user not found")]
    UserNotFound,

    /// Administrative caller presented the wrong secret.
    #[error("unauthorized")]
    Unauthorized,

    /// Lifecycle guard rejected a state change.
    #[error("invalid connection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl IntoResponse for PresenceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PresenceError::UserNotFound => (StatusCode::BAD_REQUEST, self.to_string()),
            PresenceError::Unauthorized | PresenceError::SessionInvalid(_) => {
                (StatusCode::UNAUTHORIZED, "unauthorized".to_string())
            }
            PresenceError::StoreUnavailable(e) => {
                tracing::warn!(error = %e, "Identity store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "presence store unavailable".to_string(),
                )
            }
            PresenceError::InvalidTransition { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
