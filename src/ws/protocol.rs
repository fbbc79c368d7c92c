//! JSON messages exchanged over the presence WebSocket.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::PresenceStatus;
use crate::ws::ConnectionSender;

/// Close code: session token expired.
pub const CLOSE_SESSION_EXPIRED: u16 = 4001;
/// Close code: session token missing or invalid.
pub const CLOSE_SESSION_INVALID: u16 = 4002;
/// Close code: a newer connection took over this user's session.
pub const CLOSE_SESSION_CONFLICT: u16 = 4003;
/// Close code: identity store unreachable while registering.
pub const CLOSE_STORE_UNAVAILABLE: u16 = 4005;

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness probe.
    Ping,
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a client ping.
    Pong,
    /// A user went online or offline.
    Presence {
        user_identity: String,
        status: PresenceStatus,
    },
    /// This connection was superseded by a newer one for the same user.
    Conflict { message: String },
    /// Server-initiated notification (achievements etc).
    Notification { payload: Value },
    /// Request could not be handled.
    Error { code: u16, message: String },
}

impl ServerMessage {
    /// Encode as a WebSocket text frame.
    pub fn to_ws(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode server message");
                None
            }
        }
    }
}

/// Handle an incoming text frame from an active connection.
pub fn handle_text_message(text: &str, tx: &ConnectionSender, connection_id: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => {
            send_message(tx, &ServerMessage::Pong);
        }
        Err(e) => {
            tracing::debug!(
                connection_id = %connection_id,
                error = %e,
                "Failed to decode client message"
            );
            send_message(
                tx,
                &ServerMessage::Error {
                    code: 400,
                    message: "Invalid message".to_string(),
                },
            );
        }
    }
}

/// Encode and queue a message on a connection's outbound channel.
pub fn send_message(tx: &ConnectionSender, msg: &ServerMessage) -> bool {
    match msg.to_ws() {
        Some(frame) => tx.send(frame).is_ok(),
        None => false,
    }
}
