// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer-token authentication for the request pipeline.
//!
//! When the manifest advertises `bearer`, a [`TokenValidator`] must be
//! supplied at server construction. The pipeline reads the
//! `Authorization` header, accepts only the `Bearer` scheme
//! (case-insensitive), runs the validator, and either resolves an
//! authenticated agent URN or rejects the request as a JSON-RPC
//! invalid-request error. The validation pipeline then enforces
//! `sender == authenticated agent`.

use asap_core::AgentUrn;
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use std::sync::Arc;
use thiserror::Error;

/// Authentication failures, surfaced as a JSON-RPC invalid-request
/// error by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header on a server that requires auth.
    #[error("Authentication required")]
    MissingCredentials,

    /// An `Authorization` header with a non-Bearer scheme.
    #[error("Unsupported authentication scheme; expected Bearer")]
    UnsupportedScheme,

    /// The validator rejected the token.
    #[error("Invalid authentication token")]
    InvalidToken,
}

/// Resolves a bearer token to the agent URN it authenticates.
///
/// Async validators are awaited on the event loop; wrap synchronous
/// validators with [`blocking_token_validator`] so they run on a worker
/// instead of blocking the loop.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Some(agent)` when the token is valid, `None` otherwise.
    async fn validate(&self, token: &str) -> Option<AgentUrn>;
}

struct FnValidator<F>(F);

#[async_trait]
impl<F, Fut> TokenValidator for FnValidator<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Option<AgentUrn>> + Send,
{
    async fn validate(&self, token: &str) -> Option<AgentUrn> {
        (self.0)(token.to_string()).await
    }
}

/// Wrap an async closure as a [`TokenValidator`].
pub fn token_validator_fn<F, Fut>(f: F) -> Arc<dyn TokenValidator>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<AgentUrn>> + Send + 'static,
{
    Arc::new(FnValidator(f))
}

struct BlockingValidator<F>(Arc<F>);

#[async_trait]
impl<F> TokenValidator for BlockingValidator<F>
where
    F: Fn(&str) -> Option<AgentUrn> + Send + Sync + 'static,
{
    async fn validate(&self, token: &str) -> Option<AgentUrn> {
        let f = self.0.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || f(&token)).await.ok().flatten()
    }
}

/// Wrap a synchronous validator; each call is dispatched onto a
/// blocking worker.
pub fn blocking_token_validator<F>(f: F) -> Arc<dyn TokenValidator>
where
    F: Fn(&str) -> Option<AgentUrn> + Send + Sync + 'static,
{
    Arc::new(BlockingValidator(Arc::new(f)))
}

/// Extract the bearer token from an `Authorization` header value.
fn bearer_token(header: &str) -> Result<&str, AuthError> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    let token = parts.next().unwrap_or("").trim();
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::UnsupportedScheme);
    }
    if token.is_empty() {
        return Err(AuthError::InvalidToken);
    }
    Ok(token)
}

/// Run the auth step against request headers.
///
/// Returns `Ok(None)` when no validator is configured (open server),
/// `Ok(Some(agent))` for valid credentials.
///
/// # Errors
///
/// An [`AuthError`] that the caller maps to a JSON-RPC invalid-request
/// reply.
pub async fn authenticate(
    validator: Option<&Arc<dyn TokenValidator>>,
    headers: &HeaderMap,
) -> Result<Option<AgentUrn>, AuthError> {
    let Some(validator) = validator else {
        return Ok(None);
    };
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;
    let token = bearer_token(header)?;
    match validator.validate(token).await {
        Some(agent) => Ok(Some(agent)),
        None => Err(AuthError::InvalidToken),
    }
}
