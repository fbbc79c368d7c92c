use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::actor;

/// Name of the cookie that may carry the session token.
const SESSION_COOKIE: &str = "session";

/// Query parameters for WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsSessionQuery {
    pub token: Option<String>,
}

/// GET /ws?token=SESSION
/// WebSocket upgrade endpoint. The session token comes from the `token` query
/// parameter, or the `session` cookie when the parameter is absent.
/// The upgrade always succeeds; session validation happens on the open
/// socket so a rejected client gets a close code instead of an HTTP error.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsSessionQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .or_else(|| session_cookie(&headers));

    ws.on_upgrade(move |socket| actor::run_connection(socket, state, token))
}

/// Pull the session token out of the Cookie header(s).
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}
