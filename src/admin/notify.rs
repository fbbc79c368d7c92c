use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PresenceError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub secret: String,
    pub user_identity: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub status: String,
}

/// POST /api/notify — Push a payload to one user's live connection.
/// Body: { "secret": "...", "userIdentity": "...", "payload": <any JSON> }
///
/// The secret is checked before any lookup, so a bad secret never reveals
/// whether the user is online. 400 when the user has no live connection.
pub async fn notify_user(
    State(state): State<AppState>,
    Json(req): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, PresenceError> {
    if let Err(e) = state.admin_secret.require(&req.secret) {
        tracing::warn!("Notify request with wrong admin secret");
        return Err(e);
    }

    let delivery = state
        .dispatcher
        .deliver(&req.user_identity, req.payload)
        .await?;

    tracing::info!(
        user_identity = %req.user_identity,
        connection_id = %delivery.connection_id,
        "Admin notification sent"
    );

    Ok(Json(NotifyResponse {
        status: "sent".to_string(),
    }))
}
