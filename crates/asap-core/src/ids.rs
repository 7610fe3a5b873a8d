// SPDX-License-Identifier: MIT OR Apache-2.0
//! Identifier generation.

use uuid::Uuid;

/// Generate a fresh unique identifier for envelopes, requests, and
/// idempotency keys (UUID v4, hyphenated).
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
