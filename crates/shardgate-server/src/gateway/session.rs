//! One WebSocket connection from upgrade to close.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use shardgate_core::metrics::{
    ACKS_RECEIVED_TOTAL, COMMANDS_REJECTED_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_DISCONNECTIONS_TOTAL,
    WS_HANDSHAKE_FAILURES_TOTAL, WS_IDENTITY_REPLACED_TOTAL, WS_PROTOCOL_VIOLATIONS_TOTAL, WS_SESSIONS_ACTIVE,
};
use shardgate_core::{Envelope, EnvelopeType, GatewayError, Result};
use shardgate_correlation::RequestOrigin;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::commands::rejection;
use super::connection::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, ClientConnection, Outbound,
};
use super::handshake::{Identity, authenticate};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::server::{AppState, ConnectionPermit};

/// Bound on flushing queued frames after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame a client may send in the ACTIVE state.
#[derive(Debug)]
pub(crate) enum Inbound {
    Command(Envelope),
    Ack(Envelope),
}

/// Parse and classify an inbound text frame. Anything but COMMAND or ACK
/// is a protocol violation.
pub(crate) fn classify(text: &str) -> Result<Inbound> {
    let envelope = Envelope::parse(text)?;
    match envelope.kind {
        EnvelopeType::Command => Ok(Inbound::Command(envelope)),
        EnvelopeType::Ack => Ok(Inbound::Ack(envelope)),
        other => Err(GatewayError::protocol(format!("clients may not send {other}"))),
    }
}

/// Drive a socket through AUTHENTICATING, ACTIVE and CLOSED.
#[instrument(skip_all, fields(client_id = tracing::field::Empty))]
pub async fn run_session(socket: WebSocket, state: AppState, permit: ConnectionPermit) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let identity = match authenticate(&mut ws_rx, state.validator.as_ref(), state.config.handshake_timeout).await {
        Ok(identity) => identity,
        Err(err) => {
            counter!(WS_HANDSHAKE_FAILURES_TOTAL, "reason" => err.reason()).increment(1);
            info!(error = %err, "handshake failed");
            if let Some(code) = err.close_code() {
                let _ = ws_tx.send(close_message(code, &err.to_string())).await;
            }
            return;
        }
    };
    let Identity { client_id, client_type } = identity;
    tracing::Span::current().record("client_id", tracing::field::display(&client_id));

    let (tx, rx) = mpsc::channel(state.config.send_queue_capacity);
    let conn = Arc::new(ClientConnection::new(client_id.clone(), client_type, tx));
    let writer = tokio::spawn(run_writer(ws_tx, rx, state.config.heartbeat_interval));

    let confirm = match Envelope::auth_confirm(client_id.clone(), client_type) {
        Ok(confirm) => confirm,
        Err(err) => {
            warn!(%client_id, error = %err, "failed to build auth confirmation");
            conn.close(CLOSE_INTERNAL_ERROR, "internal error").await;
            drop(conn);
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
            return;
        }
    };
    // queued before registration so the client sees AUTH_CONFIRM first
    let _ = conn.send_envelope(&confirm);
    if let Some(previous) = state.sessions.register(Arc::clone(&conn)) {
        counter!(WS_IDENTITY_REPLACED_TOTAL).increment(1);
        info!(%client_id, old_connection = %previous.id, "identity taken over by a new connection");
        previous.close(CLOSE_NORMAL, "replaced by a newer connection").await;
    }
    gauge!(WS_SESSIONS_ACTIVE, "client_type" => client_type.as_str()).increment(1.0);
    info!(%client_id, %client_type, connection_id = %conn.id, "client authenticated");

    read_loop(&mut ws_rx, &conn, &state).await;

    let removed = state.sessions.remove(&client_id, &conn.id);
    if removed {
        let cancelled = state.commands.cancel_for_client(&client_id).await;
        if cancelled > 0 {
            debug!(%client_id, cancelled, "cancelled pending commands of closed session");
        }
    }
    gauge!(WS_SESSIONS_ACTIVE, "client_type" => client_type.as_str()).decrement(1.0);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(%client_id, connection_id = %conn.id, dropped = conn.drop_count(), "client disconnected");

    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(%client_id, "writer did not drain in time");
    }
    drop(permit);
}

async fn read_loop<S>(ws_rx: &mut S, conn: &Arc<ClientConnection>, state: &AppState)
where
    S: futures::Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let heartbeat_stop = state.shutdown.child_token();
    let heartbeat = run_heartbeat(
        Arc::clone(conn),
        state.config.heartbeat_interval,
        state.config.heartbeat_timeout,
        heartbeat_stop.clone(),
    );
    tokio::pin!(heartbeat);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            violation(conn, "non-UTF8 binary frame").await;
                            break;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        conn.mark_alive();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id = %conn.client_id, "client closed the connection");
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(client_id = %conn.client_id, error = %err, "socket read failed");
                        break;
                    }
                };
                conn.mark_alive();
                if let Err(err) = handle_frame(&text, conn, state).await {
                    violation(conn, &err.to_string()).await;
                    break;
                }
            }
            result = &mut heartbeat => {
                if result == HeartbeatResult::TimedOut {
                    warn!(client_id = %conn.client_id, idle_ms = conn.idle_for().as_millis(), "client unresponsive, disconnecting");
                    conn.close(CLOSE_GOING_AWAY, "heartbeat timeout").await;
                } else {
                    conn.close(CLOSE_GOING_AWAY, "server shutting down").await;
                }
                break;
            }
        }
    }
    heartbeat_stop.cancel();
}

async fn handle_frame(text: &str, conn: &ClientConnection, state: &AppState) -> Result<()> {
    match classify(text)? {
        Inbound::Command(envelope) => {
            let correlation_id = envelope.correlation_id.clone();
            if let Err(err) = state
                .commands
                .route(&conn.client_id, envelope, RequestOrigin::Websocket)
                .await
            {
                if !matches!(err, GatewayError::InvalidParams { .. } | GatewayError::UnknownCommand { .. }) {
                    counter!(COMMANDS_REJECTED_TOTAL, "code" => err.code().to_owned()).increment(1);
                }
                info!(client_id = %conn.client_id, %correlation_id, code = err.code(), "command rejected");
                let reply = rejection(correlation_id, conn.client_id.clone(), &err)?;
                let _ = conn.send_envelope(&reply);
            }
        }
        Inbound::Ack(envelope) => {
            counter!(ACKS_RECEIVED_TOTAL).increment(1);
            debug!(client_id = %conn.client_id, correlation_id = %envelope.correlation_id, "client acknowledged");
        }
    }
    Ok(())
}

async fn violation(conn: &ClientConnection, reason: &str) {
    counter!(WS_PROTOCOL_VIOLATIONS_TOTAL).increment(1);
    warn!(client_id = %conn.client_id, reason, "protocol violation, closing connection");
    conn.close(CLOSE_PROTOCOL_ERROR, reason).await;
}

/// Forward queued frames to the socket and ping on a fixed cadence.
///
/// Ends after a close frame, on a send failure, or once every sender is gone.
async fn run_writer(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>, ping_every: Duration) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let started = Instant::now();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = ws_tx.send(close_message(code, &reason)).await;
                    break;
                }
                None => {
                    let _ = ws_tx.send(close_message(CLOSE_NORMAL, "")).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
    debug!(open_ms = started.elapsed().as_millis(), "writer finished");
}

fn close_message(code: u16, reason: &str) -> Message {
    // close reasons are capped at 123 bytes by the protocol
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason[..end].to_owned().into(),
    }))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn command_and_ack_are_accepted() {
        let cmd = json!({"type": "COMMAND", "correlationId": "c1", "payload": {"domain": "auth", "action": "login"}});
        assert_matches!(classify(&cmd.to_string()), Ok(Inbound::Command(env)) if env.correlation_id.as_str() == "c1");
        let ack = json!({"type": "ACK", "correlationId": "r1"});
        assert_matches!(classify(&ack.to_string()), Ok(Inbound::Ack(_)));
    }

    #[test]
    fn server_side_types_are_violations() {
        for kind in ["RESPONSE", "EVENT", "SYSTEM_COMMAND", "AUTH_CONFIRM"] {
            let frame = json!({"type": kind, "payload": {}});
            assert_matches!(
                classify(&frame.to_string()),
                Err(GatewayError::ProtocolViolation { .. }),
                "{kind} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_type_and_garbage_are_violations() {
        assert_matches!(classify(r#"{"type":"HELLO"}"#), Err(GatewayError::ProtocolViolation { .. }));
        assert_matches!(classify("not json"), Err(GatewayError::ProtocolViolation { .. }));
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let Message::Close(Some(frame)) = close_message(CLOSE_PROTOCOL_ERROR, &long) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, CLOSE_PROTOCOL_ERROR);
        assert!(frame.reason.as_str().len() <= 123);
    }
}
