// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-client manifest cache with TTL.

use asap_core::Manifest;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default manifest cache TTL (matches the server's `Cache-Control`).
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(300);

/// TTL cache of manifest URL → manifest.
///
/// Per-client state; unlike the circuit breaker registry it is never
/// shared across clients.
#[derive(Debug)]
pub struct ManifestCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Manifest, Instant)>>,
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST_TTL)
    }
}

impl ManifestCache {
    /// Cache whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A live cached manifest for `url`, if any.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Manifest> {
        let entries = self.entries.lock().expect("manifest cache lock poisoned");
        entries.get(url).and_then(|(manifest, stored_at)| {
            (stored_at.elapsed() < self.ttl).then(|| manifest.clone())
        })
    }

    /// Store a freshly fetched manifest.
    pub fn set(&self, url: &str, manifest: Manifest) {
        let mut entries = self.entries.lock().expect("manifest cache lock poisoned");
        entries.insert(url.to_string(), (manifest, Instant::now()));
    }

    /// Drop the entry for `url` (called on any fetch or validation error).
    pub fn invalidate(&self, url: &str) {
        let mut entries = self.entries.lock().expect("manifest cache lock poisoned");
        entries.remove(url);
    }
}
