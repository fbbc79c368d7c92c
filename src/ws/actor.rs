use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::auth::session;
use crate::error::PresenceError;
use crate::presence::{new_connection_id, ConnectionLifecycle};
use crate::state::AppState;
use crate::ws::protocol::{self, CLOSE_SESSION_INVALID, CLOSE_STORE_UNAVAILABLE};

/// Ping interval: server sends WebSocket ping every 30 seconds.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long queued frames (e.g. a close frame) get to reach the socket after
/// the connection is torn down.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the actor-per-connection pattern for one WebSocket.
///
/// Drives the connection through its lifecycle: session validation, registry
/// activation (evicting any prior session for the same user), the reader
/// loop, and cleanup. The writer half owns the sink and drains an mpsc
/// channel, so any part of the system can push frames by cloning the sender.
pub async fn run_connection(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let controller = state.lifecycle.clone();
    let mut lc = ConnectionLifecycle::new(new_connection_id());

    let reloaded = session::reload_session(&state.session_secret, token.as_deref());
    let user_identity = match controller.validate(&mut lc, reloaded) {
        Ok(identity) => identity,
        Err(err) => {
            let close_code = match &err {
                PresenceError::SessionInvalid(rejection) => rejection.close_code(),
                _ => CLOSE_SESSION_INVALID,
            };
            tracing::warn!(
                connection_id = %lc.connection_id(),
                close_code = close_code,
                error = %err,
                "WebSocket session rejected"
            );
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code,
                    reason: "Session invalid".into(),
                })))
                .await;
            return;
        }
    };
    let connection_id = lc.connection_id().to_string();

    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let activation = match controller.activate(&mut lc, tx.clone()).await {
        Ok(activation) => activation,
        Err(err) => {
            tracing::warn!(
                user_identity = %user_identity,
                connection_id = %connection_id,
                error = %err,
                "WebSocket connection not activated"
            );
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CLOSE_STORE_UNAVAILABLE,
                reason: "Presence store unavailable".into(),
            })));
            drop(tx);
            flush_writer(writer_handle).await;
            return;
        }
    };

    tracing::info!(
        user_identity = %user_identity,
        connection_id = %connection_id,
        evicted = ?activation.evicted,
        "WebSocket actor started"
    );

    // Track pong reception
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_handle = tokio::spawn(keepalive_task(
        tx.clone(),
        pong_rx,
        activation.shutdown.clone(),
        PING_INTERVAL,
        PONG_TIMEOUT,
    ));

    // Reader loop: process incoming WebSocket messages until the client goes
    // away or this connection is evicted.
    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = activation.shutdown.notified() => {
                tracing::info!(
                    user_identity = %user_identity,
                    connection_id = %connection_id,
                    "Connection shut down (evicted or pong timeout)"
                );
                break;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), &tx, &connection_id);
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        "Ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();

    match controller.close(&mut lc).await {
        Ok(went_offline) => {
            tracing::info!(
                user_identity = %user_identity,
                connection_id = %connection_id,
                went_offline,
                "WebSocket actor stopped"
            );
        }
        Err(err) => {
            tracing::warn!(
                user_identity = %user_identity,
                connection_id = %connection_id,
                error = %err,
                "Failed to clean up presence mapping"
            );
        }
    }

    drop(tx);
    flush_writer(writer_handle).await;
}

/// Ping task: sends a ping every `every` and, when no pong follows within
/// `wait`, queues a close frame and wakes the reader loop through `shutdown`.
async fn keepalive_task(
    tx: mpsc::UnboundedSender<Message>,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    shutdown: Arc<Notify>,
    every: Duration,
    wait: Duration,
) {
    let mut ping_timer = interval(every);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        if tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
            // Writer task has died, connection is gone
            break;
        }

        match timeout(wait, pong_rx.recv()).await {
            Ok(Some(())) => {}
            _ => {
                tracing::warn!("Pong timeout, closing connection");
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: "Pong timeout".into(),
                })));
                shutdown.notify_one();
                break;
            }
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the
/// WebSocket sink. Stops after a close frame.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || is_close {
            break;
        }
    }
}

/// Give the writer a moment to drain queued frames, then stop it.
async fn flush_writer(mut handle: JoinHandle<()>) {
    if timeout(WRITER_FLUSH_TIMEOUT, &mut handle).await.is_err() {
        handle.abort();
    }
}
