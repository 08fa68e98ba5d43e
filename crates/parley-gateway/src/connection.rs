use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace, warn};

use parley_types::events::{Ack, AckOutcome, ClientCommand, ClientFrame, ErrorCode, ServerEvent};
use parley_types::models::ConnectionId;

use crate::dispatcher::PushError;
use crate::lifecycle::{ConnectionHandle, Gateway};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Drive one WebSocket from accept to close. The credential comes either from
/// the upgrade request (`token`) or from the first `Identify` frame.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let handle = gateway.on_connect().await;
    let conn_id = handle.id;

    let authenticated = match token {
        Some(token) => match gateway.on_credential(conn_id, &token).await {
            Ok(_) => true,
            Err(e) => {
                let ack = error_ack(None, e.code(), e.to_string());
                let _ = send_event(&mut sender, &ServerEvent::Ack(ack)).await;
                false
            }
        },
        None => {
            let timeout = gateway.config().handshake_timeout;
            match tokio::time::timeout(
                timeout,
                wait_for_identify(&mut sender, &mut receiver, &gateway, conn_id),
            )
            .await
            {
                Ok(done) => done,
                Err(_) => {
                    warn!("Connection {} did not identify within {:?}, closing", conn_id, timeout);
                    false
                }
            }
        }
    };

    if !authenticated {
        gateway.on_disconnect(conn_id).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    run_connection_loop(sender, receiver, gateway, handle).await;
}

/// Read frames until an `Identify` succeeds. Anything else is answered with
/// a `NotAuthenticated` ack. Acks are written straight to the socket since
/// the outbound pump is not running yet.
async fn wait_for_identify(
    sender: &mut WsSink,
    receiver: &mut WsStream,
    gateway: &Gateway,
    conn_id: ConnectionId,
) -> bool {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return false,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let ack = error_ack(None, ErrorCode::BadFrame, e.to_string());
                if send_event(sender, &ServerEvent::Ack(ack)).await.is_err() {
                    return false;
                }
                continue;
            }
        };

        let is_identify = matches!(frame.command, ClientCommand::Identify { .. });
        let ack = gateway.on_client_intent(conn_id, frame).await;
        let accepted = is_identify && ack.is_ok();
        if send_event(sender, &ServerEvent::Ack(ack)).await.is_err() {
            return false;
        }
        if accepted {
            return true;
        }
        if is_identify {
            // Failed authentication closes the connection.
            return false;
        }
    }
    false
}

/// Pump outbound events to the socket and inbound frames to the gateway until
/// either side ends, the heartbeat lapses, or the gateway evicts us.
async fn run_connection_loop(
    mut sender: WsSink,
    mut receiver: WsStream,
    gateway: Gateway,
    handle: ConnectionHandle,
) {
    let ConnectionHandle {
        id: conn_id,
        mut events,
        eviction,
    } = handle;

    let heartbeat_interval = gateway.config().heartbeat_interval;
    let max_missed = gateway.config().max_missed_heartbeats;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let send_eviction = eviction.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = send_eviction.cancelled() => {
                    // Flush what is already queued, then close.
                    while let Ok(event) = events.try_recv() {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= max_missed {
                            warn!("Heartbeat timeout on {} (missed {} pongs), dropping", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    trace!("Ping {}", conn_id);
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_gateway = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let ack = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => recv_gateway.on_client_intent(conn_id, frame).await,
                        Err(e) => {
                            warn!(
                                "{} bad frame: {} -- raw: {}",
                                conn_id,
                                e,
                                text.chars().take(200).collect::<String>()
                            );
                            error_ack(None, ErrorCode::BadFrame, e.to_string())
                        }
                    };
                    if let Err(PushError::Closed) = recv_gateway.reply(conn_id, ack).await {
                        break;
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.on_disconnect(conn_id).await;
    info!("Connection {} closed", conn_id);
}

async fn send_event(sender: &mut WsSink, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Dropping unencodable event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

fn error_ack(request_id: Option<u64>, code: ErrorCode, message: String) -> Ack {
    Ack {
        request_id,
        outcome: AckOutcome::Error { code, message },
    }
}
