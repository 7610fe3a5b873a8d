// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent self-description served at `/.well-known/asap/manifest.json`.

use crate::urn::AgentUrn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Well-known path the manifest is served from.
pub const MANIFEST_PATH: &str = "/.well-known/asap/manifest.json";

/// Errors from validating a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// `version` is not a `MAJOR.MINOR.PATCH` semver string.
    #[error("invalid manifest version {0:?}: expected MAJOR.MINOR.PATCH")]
    BadVersion(String),

    /// The ASAP endpoint URL is empty.
    #[error("manifest endpoints.asap must not be empty")]
    EmptyEndpoint,

    /// `auth.schemes` advertises an empty scheme list.
    #[error("manifest auth block present but schemes list is empty")]
    EmptyAuthSchemes,
}

/// One skill an agent advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// Stable skill identifier, e.g. `"echo"`.
    pub id: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What the agent can do: protocol version, skills, feature flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Protocol version the agent speaks.
    pub asap_version: String,
    /// Advertised skills.
    #[serde(default)]
    pub skills: Vec<Skill>,
    /// Optional feature flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, bool>,
}

/// Where the agent can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    /// ASAP JSON-RPC endpoint URL.
    pub asap: String,
    /// Optional events (WebSocket) URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
}

/// OAuth2 parameters, present when `oauth2` is among the schemes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Config {
    /// Authorization endpoint.
    pub authorization_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Requested scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Supported authentication schemes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthScheme {
    /// Scheme names, e.g. `["bearer"]`.
    pub schemes: Vec<String>,
    /// OAuth2 block when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Config>,
}

impl AuthScheme {
    /// Whether `bearer` is among the advertised schemes (case-insensitive).
    #[must_use]
    pub fn supports_bearer(&self) -> bool {
        self.schemes.iter().any(|s| s.eq_ignore_ascii_case("bearer"))
    }
}

/// An agent's self-description.
///
/// Loaded at startup, served with cache headers, and cacheable client-side
/// for a configurable TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Agent URN.
    pub id: AgentUrn,
    /// Semver agent version.
    pub version: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Protocol capabilities.
    pub capabilities: Capabilities,
    /// Reachability endpoints.
    pub endpoints: Endpoints,
    /// Authentication block, absent for open agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,
    /// Detached signature over the manifest body, if signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Manifest {
    /// Check structural invariants that serde alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ManifestError`].
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut parts = self.version.split('.');
        let all_numeric = parts.by_ref().take(3).all(|p| p.parse::<u64>().is_ok());
        if !all_numeric
            || parts.next().is_some()
            || self.version.split('.').count() != 3
        {
            return Err(ManifestError::BadVersion(self.version.clone()));
        }
        if self.endpoints.asap.is_empty() {
            return Err(ManifestError::EmptyEndpoint);
        }
        if let Some(auth) = &self.auth {
            if auth.schemes.is_empty() {
                return Err(ManifestError::EmptyAuthSchemes);
            }
        }
        Ok(())
    }

    /// Whether the manifest advertises bearer-token auth.
    #[must_use]
    pub fn requires_bearer_auth(&self) -> bool {
        self.auth.as_ref().is_some_and(AuthScheme::supports_bearer)
    }
}
