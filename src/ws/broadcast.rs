use axum::extract::ws::{CloseFrame, Message};

use super::protocol::ServerMessage;
use super::ConnectionTable;

/// Broadcast a message to every attached connection. Returns how many
/// connections it was queued for.
pub fn broadcast_to_all(table: &ConnectionTable, msg: &ServerMessage) -> usize {
    let Some(frame) = msg.to_ws() else {
        return 0;
    };

    let mut sent = 0;
    for entry in table.iter() {
        if entry.value().sender.send(frame.clone()).is_ok() {
            sent += 1;
        }
    }
    sent
}

/// Send a message to one connection. Returns false if the connection is not
/// attached here or its channel is gone.
pub fn send_to_connection(table: &ConnectionTable, connection_id: &str, msg: &ServerMessage) -> bool {
    let Some(frame) = msg.to_ws() else {
        return false;
    };

    table
        .get(connection_id)
        .map(|handle| handle.sender.send(frame).is_ok())
        .unwrap_or(false)
}

/// Force-close one connection: queue a Close frame and wake its reader loop.
pub fn force_close_connection(
    table: &ConnectionTable,
    connection_id: &str,
    close_code: u16,
    reason: &str,
) -> bool {
    let Some(handle) = table.get(connection_id) else {
        return false;
    };

    let close_frame = CloseFrame {
        code: close_code,
        reason: reason.into(),
    };
    let _ = handle.sender.send(Message::Close(Some(close_frame)));
    handle.shutdown.notify_one();
    true
}
