// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket transport behavior against a local server.

use asap_core::{AgentUrn, Envelope};
use asap_ws::{WebSocketTransport, WsConfig, WsError, on_message_fn};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

fn urn(name: &str) -> AgentUrn {
    AgentUrn::parse(format!("urn:asap:agent:{name}")).unwrap()
}

fn request_envelope() -> Envelope {
    Envelope::builder()
        .sender(urn("client"))
        .recipient(urn("server"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c1", "skill_id": "echo", "input": {"m": "hi"}}))
        .unwrap()
        .build()
        .unwrap()
}

fn response_frame_for(request: &Value) -> String {
    let request_envelope = &request["params"]["envelope"];
    let reply = Envelope::builder()
        .sender(urn("server"))
        .recipient(urn("client"))
        .payload_type("task.response")
        .payload_json(json!({"task_id": "t1", "status": "completed", "result": {}}))
        .unwrap()
        .correlation_id(request_envelope["id"].as_str().unwrap_or(""))
        .build()
        .unwrap();
    json!({"jsonrpc": "2.0", "result": {"envelope": reply}, "id": request["id"]}).to_string()
}

/// Spawn a raw WebSocket server; each connection is handed to `handler`.
async fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: Fn(WebSocketStream<TcpStream>) -> futures::future::BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            let handler = handler.clone();
            tokio::spawn(async move { handler(ws).await });
        }
    });
    addr
}

fn echo_responder(ws: WebSocketStream<TcpStream>) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        let (mut sink, mut stream) = ws.split();
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame.get("method").and_then(Value::as_str) == Some("asap.send") {
                    let _ = sink
                        .send(Message::Text(response_frame_for(&frame).into()))
                        .await;
                }
            }
        }
    })
}

#[tokio::test]
async fn send_and_receive_correlates_by_request_id() {
    let addr = spawn_server(echo_responder).await;
    let transport = WebSocketTransport::new();
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    let response = transport.send_and_receive(&request_envelope()).await.unwrap();
    assert_eq!(response.payload_type(), "task.response");
    transport.close().await;
}

#[tokio::test]
async fn first_connect_failure_is_surfaced_even_with_reconnect() {
    let transport = WebSocketTransport::with_config(WsConfig {
        reconnect_on_disconnect: true,
        initial_backoff: Duration::from_millis(10),
        ..WsConfig::default()
    });
    let err = transport.connect("ws://127.0.0.1:9/asap/ws").await.unwrap_err();
    assert!(matches!(err, WsError::Connect(_)));
}

#[tokio::test]
async fn app_level_ping_gets_a_pong_reply() {
    let received_pong = Arc::new(tokio::sync::Notify::new());
    let notify = received_pong.clone();

    let addr = spawn_server(move |ws| {
        let notify = notify.clone();
        Box::pin(async move {
            let (mut sink, mut stream) = ws.split();
            sink.send(Message::Text(json!({"type": "ping"}).to_string().into()))
                .await
                .unwrap();
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Text(text) = message {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    if frame.get("type").and_then(Value::as_str) == Some("pong") {
                        notify.notify_one();
                        break;
                    }
                }
            }
        })
    })
    .await;

    let transport = WebSocketTransport::new();
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), received_pong.notified())
        .await
        .expect("server never saw the pong reply");
    transport.close().await;
}

#[tokio::test]
async fn server_push_invokes_on_message_in_order() {
    let addr = spawn_server(|ws| {
        Box::pin(async move {
            let (mut sink, mut stream) = ws.split();
            for i in 0..3 {
                let push = Envelope::builder()
                    .sender(urn("server"))
                    .recipient(urn("client"))
                    .payload_type("task.update")
                    .payload_json(json!({"task_id": format!("t{i}"), "status": "working"}))
                    .unwrap()
                    .build()
                    .unwrap();
                let frame = json!({"jsonrpc": "2.0", "result": {"envelope": push}});
                sink.send(Message::Text(frame.to_string().into())).await.unwrap();
            }
            while stream.next().await.is_some() {}
        })
    })
    .await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let counter = Arc::new(AtomicUsize::new(0));
    let count = counter.clone();
    let callback = on_message_fn(move |envelope: Envelope| {
        let task_id = envelope.payload()["task_id"].as_str().unwrap().to_string();
        sink.try_lock().unwrap().push(task_id);
        count.fetch_add(1, Ordering::SeqCst);
    });

    let transport = WebSocketTransport::with_config(WsConfig {
        on_message: Some(callback),
        ..WsConfig::default()
    });
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while counter.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pushes never arrived");

    assert_eq!(*seen.lock().await, vec!["t0", "t1", "t2"]);
    transport.close().await;
}

#[tokio::test]
async fn error_frame_resolves_pending_with_remote_error() {
    let addr = spawn_server(|ws| {
        Box::pin(async move {
            let (mut sink, mut stream) = ws.split();
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Text(text) = message {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let error = json!({
                        "jsonrpc": "2.0",
                        "error": {"code": -32601, "message": "Method not found"},
                        "id": frame["id"],
                    });
                    let _ = sink.send(Message::Text(error.to_string().into())).await;
                }
            }
        })
    })
    .await;

    let transport = WebSocketTransport::new();
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    let err = transport.send_and_receive(&request_envelope()).await.unwrap_err();
    match err {
        WsError::Remote { code, message, .. } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("expected Remote, got {other:?}"),
    }
    transport.close().await;
}

#[tokio::test]
async fn receive_timeout_keeps_the_socket_usable() {
    let responses_enabled = Arc::new(AtomicUsize::new(0));
    let flag = responses_enabled.clone();

    let addr = spawn_server(move |ws| {
        let flag = flag.clone();
        Box::pin(async move {
            let (mut sink, mut stream) = ws.split();
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Text(text) = message {
                    // Stay silent for the first request only.
                    if flag.fetch_add(1, Ordering::SeqCst) == 0 {
                        continue;
                    }
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let _ = sink
                        .send(Message::Text(response_frame_for(&frame).into()))
                        .await;
                }
            }
        })
    })
    .await;

    let transport = WebSocketTransport::with_config(WsConfig {
        receive_timeout: Duration::from_millis(100),
        ..WsConfig::default()
    });
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    let err = transport.send_and_receive(&request_envelope()).await.unwrap_err();
    assert!(matches!(err, WsError::Timeout { .. }));

    // Socket still open: the next exchange succeeds.
    let response = transport.send_and_receive(&request_envelope()).await.unwrap();
    assert_eq!(response.payload_type(), "task.response");
    transport.close().await;
}

#[tokio::test]
async fn ack_notification_clears_pending_entry() {
    let addr = spawn_server(|ws| {
        Box::pin(async move {
            let (mut sink, mut stream) = ws.split();
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Text(text) = message {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let envelope = &frame["params"]["envelope"];
                    if envelope["requires_ack"] == true {
                        let ack_envelope = Envelope::builder()
                            .sender(urn("server"))
                            .recipient(urn("client"))
                            .payload_type("MessageAck")
                            .payload_json(json!({
                                "original_envelope_id": envelope["id"],
                                "status": "received",
                            }))
                            .unwrap()
                            .build()
                            .unwrap();
                        let ack = json!({
                            "jsonrpc": "2.0",
                            "method": "asap.ack",
                            "params": {"envelope": ack_envelope},
                        });
                        sink.send(Message::Text(ack.to_string().into())).await.unwrap();
                    }
                    let _ = sink
                        .send(Message::Text(response_frame_for(&frame).into()))
                        .await;
                }
            }
        })
    })
    .await;

    let transport = WebSocketTransport::new();
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    let envelope = Envelope::builder()
        .sender(urn("client"))
        .recipient(urn("server"))
        .payload_type("task.request")
        .payload_json(json!({"conversation_id": "c", "skill_id": "s", "input": {}}))
        .unwrap()
        .requires_ack(true)
        .build()
        .unwrap();

    transport.send_and_receive(&envelope).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while transport.pending_ack_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pending ack entry never cleared");
    transport.close().await;
}

#[tokio::test]
async fn reconnect_supervisor_reestablishes_the_connection() {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    let addr = spawn_server(move |ws| {
        let counter = counter.clone();
        Box::pin(async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (mut sink, mut stream) = ws.split();
            if n == 0 {
                // First connection: drop immediately to trigger reconnect.
                let _ = sink.close().await;
                return;
            }
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Text(text) = message {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let _ = sink
                        .send(Message::Text(response_frame_for(&frame).into()))
                        .await;
                }
            }
        })
    })
    .await;

    let transport = WebSocketTransport::with_config(WsConfig {
        reconnect_on_disconnect: true,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(50),
        ..WsConfig::default()
    });
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while connections.load(Ordering::SeqCst) < 2 || !transport.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("transport never reconnected");

    let response = transport.send_and_receive(&request_envelope()).await.unwrap();
    assert_eq!(response.payload_type(), "task.response");
    transport.close().await;
}

#[tokio::test]
async fn close_fails_pending_requests() {
    let addr = spawn_server(|ws| {
        Box::pin(async move {
            let (_sink, mut stream) = ws.split();
            while stream.next().await.is_some() {}
        })
    })
    .await;

    let transport = WebSocketTransport::with_config(WsConfig {
        receive_timeout: Duration::from_secs(30),
        ..WsConfig::default()
    });
    transport
        .connect(&format!("ws://{addr}/asap/ws"))
        .await
        .unwrap();

    let pending = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.send_and_receive(&request_envelope()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(WsError::Closed)));
}
