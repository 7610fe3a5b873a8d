// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent URN identifiers of the form `urn:asap:agent:<name>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix shared by every agent URN.
pub const AGENT_URN_PREFIX: &str = "urn:asap:agent:";

/// Errors from parsing an [`AgentUrn`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrnError {
    /// The string does not start with `urn:asap:agent:`.
    #[error("invalid agent URN {0:?}: expected prefix \"urn:asap:agent:\"")]
    BadPrefix(String),

    /// The agent name after the prefix is empty.
    #[error("invalid agent URN {0:?}: empty agent name")]
    EmptyName(String),
}

/// A validated agent identifier, e.g. `urn:asap:agent:billing`.
///
/// The wrapper guarantees the URN prefix and a non-empty agent name; both
/// serde paths (construction and wire decoding) go through [`AgentUrn::parse`].
///
/// # Examples
///
/// ```
/// use asap_core::AgentUrn;
///
/// let urn = AgentUrn::parse("urn:asap:agent:billing").unwrap();
/// assert_eq!(urn.name(), "billing");
/// assert!(AgentUrn::parse("https://not-a-urn").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentUrn(String);

impl AgentUrn {
    /// Parse and validate an agent URN.
    ///
    /// # Errors
    ///
    /// Returns [`UrnError`] when the prefix is wrong or the name is empty.
    pub fn parse(s: impl Into<String>) -> Result<Self, UrnError> {
        let s = s.into();
        let Some(name) = s.strip_prefix(AGENT_URN_PREFIX) else {
            return Err(UrnError::BadPrefix(s));
        };
        if name.is_empty() {
            return Err(UrnError::EmptyName(s));
        }
        Ok(Self(s))
    }

    /// Full URN string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The agent name component after the prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0[AGENT_URN_PREFIX.len()..]
    }
}

impl fmt::Display for AgentUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentUrn {
    type Error = UrnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AgentUrn> for String {
    fn from(value: AgentUrn) -> Self {
        value.0
    }
}

impl std::str::FromStr for AgentUrn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_urn() {
        let urn = AgentUrn::parse("urn:asap:agent:echo").unwrap();
        assert_eq!(urn.as_str(), "urn:asap:agent:echo");
        assert_eq!(urn.name(), "echo");
        assert_eq!(urn.to_string(), "urn:asap:agent:echo");
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(matches!(
            AgentUrn::parse("urn:other:agent:echo"),
            Err(UrnError::BadPrefix(_))
        ));
        assert!(AgentUrn::parse("echo").is_err());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(
            AgentUrn::parse("urn:asap:agent:"),
            Err(UrnError::EmptyName(_))
        ));
    }

    #[test]
    fn serde_roundtrip_validates() {
        let urn: AgentUrn = serde_json::from_str("\"urn:asap:agent:a\"").unwrap();
        assert_eq!(urn.name(), "a");
        assert_eq!(serde_json::to_string(&urn).unwrap(), "\"urn:asap:agent:a\"");

        let bad: Result<AgentUrn, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
