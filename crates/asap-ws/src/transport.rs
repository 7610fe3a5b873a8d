// SPDX-License-Identifier: MIT OR Apache-2.0
//! The WebSocket client transport.
//!
//! Owns up to three long-lived tasks per connection: the recv loop, the
//! ack-check loop, and (when auto-reconnect is enabled) a supervisor
//! driving the connect/reconnect state machine. Shutdown order is
//! supervisor, recv, ack-check, then the socket itself.

use crate::frames::{decode_frame, encode_envelope_frame, is_app_ping, pong_frame};
use crate::{
    ACK_CHECK_INTERVAL, DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_ACK_RETRIES, DEFAULT_RECEIVE_TIMEOUT,
    RECONNECT_INITIAL_BACKOFF, RECONNECT_MAX_BACKOFF,
};
use asap_core::{Envelope, Payload, is_critical_payload_type};
use asap_protocol::jsonrpc::{ASAP_ACK_METHOD, error_codes};
use asap_retry::CircuitBreaker;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Errors from the WebSocket transport.
#[derive(Debug, Clone, Error)]
pub enum WsError {
    /// No live connection; `connect` was never called or the socket died.
    #[error("WebSocket not connected; call connect() first")]
    NotConnected,

    /// The connection attempt itself failed.
    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    /// The peer answered with a JSON-RPC error frame.
    #[error("WebSocket remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Remote message.
        message: String,
        /// Structured remote detail.
        data: Option<Value>,
    },

    /// `send_and_receive` hit its deadline; the socket stays open.
    #[error("WebSocket receive timed out after {timeout:?}")]
    Timeout {
        /// The configured receive deadline.
        timeout: Duration,
    },

    /// The transport was closed while the operation was pending.
    #[error("WebSocket connection closed")]
    Closed,

    /// Writing a frame failed.
    #[error("WebSocket send failed: {0}")]
    Send(String),

    /// The connection pool was closed.
    #[error("WebSocket connection pool is closed")]
    PoolClosed,
}

/// Callback invoked for server-push envelopes that match no pending
/// request. Implementations decide whether to block or schedule work.
#[async_trait]
pub trait OnMessage: Send + Sync {
    /// Handle one pushed envelope, in receive order.
    async fn on_message(&self, envelope: Envelope);
}

struct FnCallback<F>(F);

#[async_trait]
impl<F> OnMessage for FnCallback<F>
where
    F: Fn(Envelope) + Send + Sync,
{
    async fn on_message(&self, envelope: Envelope) {
        (self.0)(envelope);
    }
}

/// Wrap a synchronous closure as an [`OnMessage`] callback.
pub fn on_message_fn<F>(f: F) -> Arc<dyn OnMessage>
where
    F: Fn(Envelope) + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// Reconnect backoff: `min(initial * 2^(attempt-1), max)` for 1-based
/// attempts.
#[must_use]
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2f64.powi(attempt.saturating_sub(1).min(62) as i32);
    Duration::from_secs_f64((initial.as_secs_f64() * factor).min(max.as_secs_f64()))
}

/// Transport configuration.
#[derive(Clone)]
pub struct WsConfig {
    /// Deadline for `send_and_receive`.
    pub receive_timeout: Duration,
    /// Reconnect automatically when the recv loop exits.
    pub reconnect_on_disconnect: bool,
    /// Reconnect attempt bound; `None` means unbounded.
    pub max_reconnect_attempts: Option<u32>,
    /// First reconnect backoff step.
    pub initial_backoff: Duration,
    /// Reconnect backoff ceiling.
    pub max_backoff: Duration,
    /// Age at which an unacknowledged envelope is retransmitted.
    pub ack_timeout: Duration,
    /// Retransmissions before the entry is dropped.
    pub max_ack_retries: u32,
    /// Scan interval of the ack-check loop.
    pub ack_check_interval: Duration,
    /// Breaker charged when ack retries are exhausted.
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    /// Server-push callback.
    pub on_message: Option<Arc<dyn OnMessage>>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            reconnect_on_disconnect: false,
            max_reconnect_attempts: None,
            initial_backoff: RECONNECT_INITIAL_BACKOFF,
            max_backoff: RECONNECT_MAX_BACKOFF,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_ack_retries: DEFAULT_MAX_ACK_RETRIES,
            ack_check_interval: ACK_CHECK_INTERVAL,
            circuit_breaker: None,
            on_message: None,
        }
    }
}

impl std::fmt::Debug for WsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConfig")
            .field("receive_timeout", &self.receive_timeout)
            .field("reconnect_on_disconnect", &self.reconnect_on_disconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("ack_timeout", &self.ack_timeout)
            .field("max_ack_retries", &self.max_ack_retries)
            .finish_non_exhaustive()
    }
}

/// One envelope awaiting an application-level acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingAck {
    /// Id of the sent envelope.
    pub envelope_id: String,
    /// When it was (last) transmitted.
    pub sent_at: Instant,
    /// Retransmissions so far.
    pub retries: u32,
    /// The envelope to retransmit.
    pub original_envelope: Envelope,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    recv: Option<JoinHandle<()>>,
    ack: Option<JoinHandle<()>>,
}

struct Inner {
    config: WsConfig,
    writer: AsyncMutex<Option<WsSink>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Result<Envelope, WsError>>>>,
    pending_acks: StdMutex<HashMap<String, PendingAck>>,
    closed: AtomicBool,
    connected: AtomicBool,
    request_counter: AtomicU64,
    tasks: StdMutex<Tasks>,
}

/// WebSocket client transport. Cheap to clone; clones share the
/// connection.
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl WebSocketTransport {
    /// Transport with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WsConfig::default())
    }

    /// Transport with explicit configuration.
    #[must_use]
    pub fn with_config(config: WsConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                writer: AsyncMutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                pending_acks: StdMutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                request_counter: AtomicU64::new(0),
                tasks: StdMutex::new(Tasks::default()),
            }),
        }
    }

    /// Whether a live socket is attached.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Unacknowledged envelopes currently tracked.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.lock().expect("ack lock poisoned").len()
    }

    /// Connect to `url` (`ws://…/asap/ws`).
    ///
    /// With `reconnect_on_disconnect` set, a supervisor task keeps
    /// reconnecting with exponential backoff after the recv loop exits;
    /// the first attempt's failure is still surfaced here synchronously.
    ///
    /// # Errors
    ///
    /// [`WsError::Connect`] when the (first) connection attempt fails.
    pub async fn connect(&self, url: &str) -> Result<(), WsError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        if self.inner.config.reconnect_on_disconnect {
            let (first_tx, first_rx) = oneshot::channel();
            let supervisor = tokio::spawn(run_loop(self.inner.clone(), url.to_string(), first_tx));
            self.inner.tasks.lock().expect("tasks lock poisoned").supervisor = Some(supervisor);
            first_rx
                .await
                .map_err(|_| WsError::Connect("reconnect supervisor exited".into()))?
        } else {
            do_connect(&self.inner, url).await.map(|_| ())
        }
    }

    /// Fire-and-forget send; registers a pending-ack entry when the
    /// envelope requires acknowledgement.
    ///
    /// # Errors
    ///
    /// [`WsError::NotConnected`] without a socket, [`WsError::Send`] on
    /// write failure.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), WsError> {
        let request_id = self.inner.next_request_id();
        let frame = encode_envelope_frame(&self.inner.wire_form(envelope)?, &request_id);
        self.inner.send_text(frame).await?;
        self.inner.register_pending_ack(envelope);
        Ok(())
    }

    /// Send an envelope and await the correlated response envelope.
    ///
    /// Expiry of `receive_timeout` removes the pending entry and raises,
    /// but does not close the socket.
    ///
    /// # Errors
    ///
    /// [`WsError::Timeout`] on deadline expiry, [`WsError::Remote`] for
    /// error frames, [`WsError::Closed`] when the transport closes while
    /// waiting.
    pub async fn send_and_receive(&self, envelope: &Envelope) -> Result<Envelope, WsError> {
        let request_id = self.inner.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id.clone(), tx);

        let frame = encode_envelope_frame(&self.inner.wire_form(envelope)?, &request_id);
        if let Err(err) = self.inner.send_text(frame).await {
            self.inner.pending.lock().expect("pending lock poisoned").remove(&request_id);
            return Err(err);
        }
        self.inner.register_pending_ack(envelope);

        match tokio::time::timeout(self.inner.config.receive_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WsError::Closed),
            Err(_) => {
                self.inner.pending.lock().expect("pending lock poisoned").remove(&request_id);
                Err(WsError::Timeout {
                    timeout: self.inner.config.receive_timeout,
                })
            }
        }
    }

    /// Close the transport: cancel supervisor, recv, and ack tasks (in
    /// that order), fail pending futures, and close the socket while
    /// swallowing OS errors.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let (supervisor, recv, ack) = {
            let mut tasks = self.inner.tasks.lock().expect("tasks lock poisoned");
            (tasks.supervisor.take(), tasks.recv.take(), tasks.ack.take())
        };
        if let Some(task) = supervisor {
            task.abort();
        }
        if let Some(task) = recv {
            task.abort();
        }
        if let Some(task) = ack {
            task.abort();
        }

        self.inner.pending_acks.lock().expect("ack lock poisoned").clear();
        self.inner.fail_pending(WsError::Closed);

        let mut writer = self.inner.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("websocket transport closed");
        }
        self.inner.connected.store(false, Ordering::SeqCst);
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn next_request_id(&self) -> String {
        format!("ws-req-{}", self.request_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Serialized wire form of `envelope`; forces `requires_ack` for
    /// critical payload types without mutating the caller's envelope.
    fn wire_form(&self, envelope: &Envelope) -> Result<Value, WsError> {
        let mut wire =
            serde_json::to_value(envelope).map_err(|e| WsError::Send(e.to_string()))?;
        if !envelope.requires_ack() && is_critical_payload_type(envelope.payload_type()) {
            wire["requires_ack"] = Value::Bool(true);
        }
        Ok(wire)
    }

    fn requires_ack(&self, envelope: &Envelope) -> bool {
        envelope.requires_ack() || is_critical_payload_type(envelope.payload_type())
    }

    fn register_pending_ack(&self, envelope: &Envelope) {
        if !self.requires_ack(envelope) {
            return;
        }
        self.pending_acks.lock().expect("ack lock poisoned").insert(
            envelope.id().to_string(),
            PendingAck {
                envelope_id: envelope.id().to_string(),
                sent_at: Instant::now(),
                retries: 0,
                original_envelope: envelope.clone(),
            },
        );
    }

    async fn send_text(&self, text: String) -> Result<(), WsError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            None => Err(WsError::NotConnected),
            Some(sink) => sink
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| WsError::Send(e.to_string())),
        }
    }

    fn fail_pending(&self, error: WsError) {
        let senders: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn take_pending(&self, id: Option<&str>) -> Option<oneshot::Sender<Result<Envelope, WsError>>> {
        let id = id?;
        self.pending.lock().expect("pending lock poisoned").remove(id)
    }

    async fn handle_frame(self: &Arc<Self>, raw: &str) {
        let data = match decode_frame(raw) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "dropping invalid websocket frame");
                return;
            }
        };

        if is_app_ping(&data) {
            let _ = self.send_text(pong_frame()).await;
            return;
        }

        if data.get("method").and_then(Value::as_str) == Some(ASAP_ACK_METHOD) {
            self.handle_ack_frame(&data);
            return;
        }

        let id_key = frame_id_key(&data);
        let id = id_key.as_deref();

        if let Some(error) = data.get("error") {
            let remote = WsError::Remote {
                code: error
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(error_codes::INTERNAL_ERROR),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
                data: error.get("data").cloned(),
            };
            match self.take_pending(id) {
                Some(tx) => {
                    let _ = tx.send(Err(remote));
                }
                None => warn!(error = %remote, "unmatched websocket error frame"),
            }
            return;
        }

        let Some(envelope_value) = data.get("result").and_then(|r| r.get("envelope")) else {
            if let Some(tx) = self.take_pending(id) {
                let _ = tx.send(Err(WsError::Remote {
                    code: error_codes::INTERNAL_ERROR,
                    message: "missing result.envelope in response".into(),
                    data: Some(data.clone()),
                }));
            }
            return;
        };

        match serde_json::from_value::<Envelope>(envelope_value.clone()) {
            Err(err) => {
                if let Some(tx) = self.take_pending(id) {
                    let _ = tx.send(Err(WsError::Remote {
                        code: error_codes::INTERNAL_ERROR,
                        message: format!("invalid envelope in response: {err}"),
                        data: None,
                    }));
                }
            }
            Ok(envelope) => match self.take_pending(id) {
                Some(tx) => {
                    let _ = tx.send(Ok(envelope));
                }
                None => {
                    if let Some(callback) = &self.config.on_message {
                        callback.on_message(envelope).await;
                    }
                }
            },
        }
    }

    fn handle_ack_frame(&self, data: &Value) {
        let Some(envelope_value) = data.get("params").and_then(|p| p.get("envelope")) else {
            return;
        };
        let Ok(envelope) = serde_json::from_value::<Envelope>(envelope_value.clone()) else {
            return;
        };
        if let Ok(Payload::MessageAck(ack)) = Payload::from_envelope(&envelope) {
            let removed = self
                .pending_acks
                .lock()
                .expect("ack lock poisoned")
                .remove(&ack.original_envelope_id);
            if removed.is_some() {
                debug!(envelope_id = %ack.original_envelope_id, status = ?ack.status, "ack received");
            }
        }
    }
}

fn frame_id_key(data: &Value) -> Option<String> {
    match data.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Open the socket, install the writer, and spawn the recv and ack
/// loops. Returns a receiver that fires when the recv loop exits.
async fn do_connect(inner: &Arc<Inner>, url: &str) -> Result<oneshot::Receiver<()>, WsError> {
    info!(url, "websocket connecting");
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| WsError::Connect(e.to_string()))?;
    let (sink, stream) = stream.split();
    *inner.writer.lock().await = Some(sink);
    inner.connected.store(true, Ordering::SeqCst);

    let (done_tx, done_rx) = oneshot::channel();
    let recv = tokio::spawn(recv_loop(inner.clone(), stream, done_tx));
    let ack = tokio::spawn(ack_check_loop(inner.clone()));
    {
        let mut tasks = inner.tasks.lock().expect("tasks lock poisoned");
        if let Some(previous) = tasks.recv.replace(recv) {
            previous.abort();
        }
        if let Some(previous) = tasks.ack.replace(ack) {
            previous.abort();
        }
    }
    info!(url, "websocket connected");
    Ok(done_rx)
}

/// Reconnect supervisor. The first attempt's outcome is reported through
/// `first_tx`; later attempts back off exponentially up to the
/// configured bound.
async fn run_loop(
    inner: Arc<Inner>,
    url: String,
    first_tx: oneshot::Sender<Result<(), WsError>>,
) {
    let mut first = Some(first_tx);
    let mut attempt: u32 = 0;
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match do_connect(&inner, &url).await {
            Ok(done_rx) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                if attempt > 0 {
                    info!(url = %url, attempt, "websocket reconnected");
                }
                let _ = done_rx.await;
                inner.connected.store(false, Ordering::SeqCst);
                *inner.writer.lock().await = None;
            }
            Err(err) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
                warn!(error = %err, attempt, "websocket reconnect attempt failed");
            }
        }
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        attempt += 1;
        if let Some(max) = inner.config.max_reconnect_attempts {
            if attempt >= max {
                warn!(attempt, "websocket reconnect attempts exhausted");
                return;
            }
        }
        let delay = reconnect_delay(attempt, inner.config.initial_backoff, inner.config.max_backoff);
        debug!(attempt, delay_secs = delay.as_secs_f64(), "websocket reconnect backoff");
        tokio::time::sleep(delay).await;
    }
}

/// Read frames until the socket closes; frames are processed strictly
/// in receive order.
async fn recv_loop(inner: Arc<Inner>, mut stream: WsStream, done: oneshot::Sender<()>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => inner.handle_frame(text.as_str()).await,
            Ok(Message::Binary(_)) => debug!("ignoring binary websocket frame"),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "websocket recv loop error");
                inner.fail_pending(WsError::Remote {
                    code: error_codes::INTERNAL_ERROR,
                    message: err.to_string(),
                    data: None,
                });
                break;
            }
        }
    }
    inner.connected.store(false, Ordering::SeqCst);
    debug!("websocket recv loop exit");
    let _ = done.send(());
}

/// Retransmit unacknowledged envelopes; exhausting the retry budget
/// drops the entry and charges the circuit breaker.
async fn ack_check_loop(inner: Arc<Inner>) {
    loop {
        tokio::time::sleep(inner.config.ack_check_interval).await;
        if inner.closed.load(Ordering::SeqCst) || !inner.connected.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let mut to_retransmit = Vec::new();
        let mut to_remove = Vec::new();
        {
            let pending_acks = inner.pending_acks.lock().expect("ack lock poisoned");
            for (id, entry) in pending_acks.iter() {
                if now.duration_since(entry.sent_at) <= inner.config.ack_timeout {
                    continue;
                }
                if entry.retries < inner.config.max_ack_retries {
                    to_retransmit.push((id.clone(), entry.original_envelope.clone()));
                } else {
                    to_remove.push(id.clone());
                }
            }
        }

        for (id, envelope) in to_retransmit {
            let request_id = inner.next_request_id();
            let frame = match inner.wire_form(&envelope) {
                Ok(wire) => encode_envelope_frame(&wire, &request_id),
                Err(err) => {
                    warn!(envelope_id = %id, error = %err, "ack retransmit encode failed");
                    continue;
                }
            };
            match inner.send_text(frame).await {
                Ok(()) => {
                    let mut pending_acks = inner.pending_acks.lock().expect("ack lock poisoned");
                    if let Some(entry) = pending_acks.get_mut(&id) {
                        entry.sent_at = Instant::now();
                        entry.retries += 1;
                        info!(
                            envelope_id = %id,
                            retries = entry.retries,
                            max_retries = inner.config.max_ack_retries,
                            "retransmitted unacknowledged envelope"
                        );
                    }
                }
                Err(err) => warn!(envelope_id = %id, error = %err, "ack retransmit failed"),
            }
        }

        for id in to_remove {
            inner.pending_acks.lock().expect("ack lock poisoned").remove(&id);
            if let Some(breaker) = &inner.config.circuit_breaker {
                breaker.record_failure();
            }
            warn!(
                envelope_id = %id,
                max_retries = inner.config.max_ack_retries,
                "ack never received; entry dropped"
            );
        }
    }
    debug!("websocket ack-check loop exit");
}
