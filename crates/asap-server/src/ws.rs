// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket endpoint: per-connection rate limiting, heartbeat,
//! acknowledgement emission, SLA subscriptions, and graceful close.

use crate::AppState;
use crate::pipeline::{Processed, process_frame};
use asap_core::{Envelope, MessageAck, AckStatus};
use asap_protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, error_codes};
use asap_ratelimit::TokenBucket;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// RFC 6455 close code for orderly shutdown.
pub const WS_CLOSE_GOING_AWAY: u16 = 1001;
/// RFC 6455 close code for policy violations (rate limiting).
pub const WS_CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close reason sent on orderly shutdown.
pub const WS_CLOSE_REASON_SHUTDOWN: &str = "Server shutting down";

/// Server heartbeat settings.
#[derive(Debug, Clone)]
pub struct WsServerSettings {
    /// Inbound messages per second per connection; `None` disables the
    /// token bucket.
    pub message_rate: Option<f64>,
    /// Interval between application-level pings.
    pub heartbeat_interval: Duration,
    /// Idle age at which a connection is considered stale and closed.
    pub stale_timeout: Duration,
}

impl Default for WsServerSettings {
    fn default() -> Self {
        Self {
            message_rate: Some(asap_ratelimit::DEFAULT_WS_MESSAGES_PER_SECOND),
            heartbeat_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(90),
        }
    }
}

pub(crate) enum WsPush {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

#[derive(Default)]
struct WsConnState {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<WsPush>>,
    sla_subscribers: HashSet<u64>,
}

/// Active WebSocket connections, tracked for SLA notifications and
/// graceful drain.
#[derive(Default)]
pub(crate) struct WsConnections {
    inner: StdMutex<WsConnState>,
}

impl WsConnections {
    fn register(&self, sender: mpsc::UnboundedSender<WsPush>) -> u64 {
        let mut inner = self.inner.lock().expect("ws connections lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.senders.insert(id, sender);
        id
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().expect("ws connections lock poisoned");
        inner.senders.remove(&id);
        inner.sla_subscribers.remove(&id);
    }

    fn subscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("ws connections lock poisoned");
        inner.sla_subscribers.insert(id);
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("ws connections lock poisoned");
        inner.sla_subscribers.remove(&id);
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.lock().expect("ws connections lock poisoned").senders.len()
    }

    pub(crate) fn broadcast_sla(&self, frame: &str) -> usize {
        let inner = self.inner.lock().expect("ws connections lock poisoned");
        let mut delivered = 0;
        for id in &inner.sla_subscribers {
            if let Some(sender) = inner.senders.get(id) {
                if sender.send(WsPush::Frame(frame.to_string())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub(crate) fn shutdown_all(&self) {
        let inner = self.inner.lock().expect("ws connections lock poisoned");
        for sender in inner.senders.values() {
            let _ = sender.send(WsPush::Close {
                code: WS_CLOSE_GOING_AWAY,
                reason: WS_CLOSE_REASON_SHUTDOWN,
            });
        }
    }
}

fn ping_frame() -> String {
    json!({"type": "ping"}).to_string()
}

fn is_app_pong(frame: &Value) -> bool {
    frame.get("type").and_then(Value::as_str) == Some("pong") && frame.get("method").is_none()
}

/// Build an `asap.ack` notification frame for `envelope`.
fn ack_frame(envelope: &Envelope, status: AckStatus, error: Option<String>) -> Option<String> {
    let ack = MessageAck {
        original_envelope_id: envelope.id().to_string(),
        status,
        error,
    };
    let ack_envelope = Envelope::builder()
        .sender(envelope.recipient().clone())
        .recipient(envelope.sender().clone())
        .asap_version(envelope.asap_version())
        .payload_type("MessageAck")
        .payload_typed(&ack)
        .ok()?
        .build()
        .ok()?;
    serde_json::to_string(&JsonRpcRequest::ack_notification(&ack_envelope)).ok()
}

/// GET `/asap/ws` upgrade handler. The upgrade request's headers carry
/// any bearer credentials, so they follow the connection into dispatch.
pub(crate) async fn ws_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, headers))
}

async fn heartbeat_loop(
    settings: WsServerSettings,
    push: mpsc::UnboundedSender<WsPush>,
    last_received: Arc<StdMutex<Instant>>,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(settings.heartbeat_interval).await;
        if closed.load(Ordering::SeqCst) {
            return;
        }
        let idle = last_received.lock().expect("heartbeat lock poisoned").elapsed();
        if idle > settings.stale_timeout {
            info!(idle_secs = idle.as_secs_f64(), "closing stale websocket connection");
            closed.store(true, Ordering::SeqCst);
            let _ = push.send(WsPush::Close {
                code: WS_CLOSE_GOING_AWAY,
                reason: WS_CLOSE_REASON_SHUTDOWN,
            });
            return;
        }
        if push.send(WsPush::Frame(ping_frame())).is_err() {
            return;
        }
    }
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, headers: HeaderMap) {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<WsPush>();
    let conn_id = state.ws_connections.register(push_tx.clone());
    info!(conn_id, "websocket client connected");

    let (mut sink, mut stream) = socket.split();

    // All writes funnel through one task so acks, replies, heartbeats,
    // and SLA pushes never interleave mid-frame.
    let writer = tokio::spawn(async move {
        while let Some(push) = push_rx.recv().await {
            match push {
                WsPush::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                WsPush::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let last_received = Arc::new(StdMutex::new(Instant::now()));
    let closed = Arc::new(AtomicBool::new(false));
    let heartbeat = tokio::spawn(heartbeat_loop(
        state.ws.clone(),
        push_tx.clone(),
        last_received.clone(),
        closed.clone(),
    ));

    let bucket = state
        .ws
        .message_rate
        .filter(|rate| *rate > 0.0)
        .map(TokenBucket::new);
    let mut rate_limited = false;

    while let Some(item) = stream.next().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let message = match item {
            Ok(message) => message,
            Err(err) => {
                warn!(conn_id, error = %err, "websocket receive error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        *last_received.lock().expect("heartbeat lock poisoned") = Instant::now();

        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            debug!(conn_id, "dropping invalid websocket frame");
            continue;
        };
        if is_app_pong(&frame) {
            continue;
        }

        if let Some(bucket) = &bucket {
            if !bucket.consume(1.0) {
                rate_limited = true;
                warn!(conn_id, limit_per_sec = bucket.rate(), "websocket rate limit exceeded");
                let reply = JsonRpcResponse::error(
                    error_codes::RATE_LIMITED,
                    "Rate limit exceeded; too many messages per second",
                    None,
                    frame.get("id").cloned().unwrap_or(Value::Null),
                );
                if let Ok(text) = serde_json::to_string(&reply) {
                    let _ = push_tx.send(WsPush::Frame(text));
                }
                break;
            }
        }

        match frame.get("method").and_then(Value::as_str) {
            Some("sla.subscribe") => {
                state.ws_connections.subscribe(conn_id);
                let reply = json!({
                    "jsonrpc": "2.0",
                    "result": {"status": "subscribed"},
                    "id": frame.get("id").cloned().unwrap_or(Value::Null),
                });
                let _ = push_tx.send(WsPush::Frame(reply.to_string()));
                continue;
            }
            Some("sla.unsubscribe") => {
                state.ws_connections.unsubscribe(conn_id);
                let reply = json!({
                    "jsonrpc": "2.0",
                    "result": {"status": "unsubscribed"},
                    "id": frame.get("id").cloned().unwrap_or(Value::Null),
                });
                let _ = push_tx.send(WsPush::Frame(reply.to_string()));
                continue;
            }
            _ => {}
        }

        // Emit the received-ack before dispatch when the wire form asks
        // for acknowledgement.
        let envelope_for_ack: Option<Envelope> = frame
            .get("params")
            .and_then(|p| p.get("envelope"))
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let requires_ack = envelope_for_ack
            .as_ref()
            .is_some_and(Envelope::requires_ack);
        if requires_ack {
            if let Some(envelope) = &envelope_for_ack {
                if let Some(ack) = ack_frame(envelope, AckStatus::Received, None) {
                    let _ = push_tx.send(WsPush::Frame(ack));
                }
            }
        }

        let reply = match process_frame(&state, frame, &headers).await {
            Processed::Rpc(reply) | Processed::Forbidden(reply) => reply,
            Processed::PoolExhausted {
                max_threads,
                active_threads,
            } => JsonRpcResponse::error(
                error_codes::INTERNAL_ERROR,
                "handler worker pool exhausted",
                Some(json!({
                    "code": "asap:transport/thread_pool_exhausted",
                    "max_threads": max_threads,
                    "active_threads": active_threads,
                })),
                Value::Null,
            ),
        };

        let dispatch_failed = reply
            .error
            .as_ref()
            .is_some_and(|e| e.code == error_codes::INTERNAL_ERROR);
        if dispatch_failed && requires_ack {
            if let Some(envelope) = &envelope_for_ack {
                let detail = reply
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "internal error".to_string());
                if let Some(ack) = ack_frame(envelope, AckStatus::Rejected, Some(detail)) {
                    let _ = push_tx.send(WsPush::Frame(ack));
                }
            }
        }

        match serde_json::to_string(&reply) {
            Ok(text) => {
                if push_tx.send(WsPush::Frame(text)).is_err() {
                    break;
                }
            }
            Err(err) => warn!(conn_id, error = %err, "failed to encode websocket reply"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    heartbeat.abort();
    state.ws_connections.unregister(conn_id);
    let _ = push_tx.send(WsPush::Close {
        code: if rate_limited {
            WS_CLOSE_POLICY_VIOLATION
        } else {
            WS_CLOSE_GOING_AWAY
        },
        reason: if rate_limited {
            "Rate limit exceeded"
        } else {
            WS_CLOSE_REASON_SHUTDOWN
        },
    });
    drop(push_tx);
    let _ = writer.await;
    info!(conn_id, "websocket client disconnected");
}
