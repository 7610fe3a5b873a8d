// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded pool of reusable WebSocket transports for one target URL.

use crate::transport::{WebSocketTransport, WsConfig, WsError};
use crate::{DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_SIZE};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

struct PoolState {
    idle: VecDeque<(WebSocketTransport, Instant)>,
    total: usize,
    closed: bool,
}

/// FIFO pool of idle transports with bounded capacity and idle expiry.
///
/// `acquire` hands back a live transport, closing any idle entry whose
/// age exceeds the idle timeout or whose socket has died; when the pool
/// is at capacity, callers wait for a release.
pub struct WebSocketConnectionPool {
    url: String,
    max_size: usize,
    idle_timeout: Duration,
    transport_config: WsConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl WebSocketConnectionPool {
    /// Pool for `url` with default bounds and transport configuration.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, DEFAULT_POOL_MAX_SIZE, DEFAULT_POOL_IDLE_TIMEOUT, WsConfig::default())
    }

    /// Pool with explicit bounds; `transport_config` seeds every
    /// connection the pool creates.
    #[must_use]
    pub fn with_config(
        url: impl Into<String>,
        max_size: usize,
        idle_timeout: Duration,
        transport_config: WsConfig,
    ) -> Self {
        Self {
            url: url.into(),
            max_size: max_size.max(1),
            idle_timeout,
            transport_config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            released: Notify::new(),
        }
    }

    /// Number of connections the pool currently accounts for.
    pub async fn total_connections(&self) -> usize {
        self.state.lock().await.total
    }

    /// Take a live transport, creating one when below capacity, else
    /// waiting for a release.
    ///
    /// # Errors
    ///
    /// [`WsError::PoolClosed`] after [`close`](Self::close);
    /// [`WsError::Connect`] when a fresh connection cannot be opened.
    pub async fn acquire(&self) -> Result<WebSocketTransport, WsError> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(WsError::PoolClosed);
                }
                let now = Instant::now();
                while let Some((transport, last_used)) = state.idle.pop_front() {
                    if now.duration_since(last_used) > self.idle_timeout {
                        state.total -= 1;
                        drop(state);
                        transport.close().await;
                        debug!(url = %self.url, "discarded idle-expired pooled connection");
                        state = self.state.lock().await;
                        continue;
                    }
                    if !transport.is_connected() {
                        state.total -= 1;
                        continue;
                    }
                    return Ok(transport);
                }
                if state.total < self.max_size {
                    state.total += 1;
                    drop(state);
                    let transport =
                        WebSocketTransport::with_config(self.transport_config.clone());
                    match transport.connect(&self.url).await {
                        Ok(()) => return Ok(transport),
                        Err(err) => {
                            self.state.lock().await.total -= 1;
                            self.released.notify_one();
                            return Err(err);
                        }
                    }
                }
            }
            // At capacity: wait for a release, then retry the idle queue.
            self.released.notified().await;
        }
    }

    /// Return a transport to the idle queue with a fresh last-used
    /// timestamp; closed pools close the transport instead.
    pub async fn release(&self, transport: WebSocketTransport) {
        let mut state = self.state.lock().await;
        if state.closed {
            state.total -= 1;
            drop(state);
            transport.close().await;
            return;
        }
        if !transport.is_connected() {
            state.total -= 1;
            drop(state);
            self.released.notify_one();
            return;
        }
        state.idle.push_back((transport, Instant::now()));
        drop(state);
        self.released.notify_one();
    }

    /// Drain and close every idle transport; later `acquire` calls fail.
    pub async fn close(&self) {
        let drained: Vec<WebSocketTransport> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.total = 0;
            state.idle.drain(..).map(|(t, _)| t).collect()
        };
        for transport in drained {
            transport.close().await;
        }
        self.released.notify_waiters();
        debug!(url = %self.url, "websocket pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let pool = WebSocketConnectionPool::new("ws://127.0.0.1:1/asap/ws");
        pool.close().await;
        assert!(matches!(pool.acquire().await, Err(WsError::PoolClosed)));
    }

    #[tokio::test]
    async fn failed_connect_releases_capacity() {
        // Nothing listens on this port; connect fails but capacity
        // accounting must roll back.
        let pool = WebSocketConnectionPool::with_config(
            "ws://127.0.0.1:9/asap/ws",
            1,
            Duration::from_secs(60),
            WsConfig::default(),
        );
        assert!(matches!(pool.acquire().await, Err(WsError::Connect(_))));
        assert_eq!(pool.total_connections().await, 0);
        assert!(matches!(pool.acquire().await, Err(WsError::Connect(_))));
    }

    #[tokio::test]
    async fn release_of_dead_transport_drops_capacity() {
        let pool = WebSocketConnectionPool::new("ws://127.0.0.1:1/asap/ws");
        {
            let mut state = pool.state.lock().await;
            state.total = 1;
        }
        let dead = WebSocketTransport::new();
        pool.release(dead).await;
        assert_eq!(pool.total_connections().await, 0);
    }
}
