use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::error::PresenceError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceQuery {
    pub secret: String,
    pub user_identity: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceAnswer {
    pub user_identity: String,
    pub online: bool,
}

/// POST /api/presence — Whether a user currently holds a live session.
/// Body: { "secret": "...", "userIdentity": "..." }
pub async fn query_presence(
    State(state): State<AppState>,
    Json(req): Json<PresenceQuery>,
) -> Result<Json<PresenceAnswer>, PresenceError> {
    state.admin_secret.require(&req.secret)?;

    let online = state.dispatcher.is_online(&req.user_identity).await?;

    Ok(Json(PresenceAnswer {
        user_identity: req.user_identity,
        online,
    }))
}
