//! Port configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// How much of the open/close lifecycle is negotiated over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum HandshakeLevel {
    /// No negotiation: open at construction, close is local.
    None = 0,
    /// Connect ping/ack negotiates open (or the transport's native open
    /// signal where it has one). Close relies on native close notifications.
    Open = 1,
    /// Connect and disconnect pings negotiate both transitions.
    Full = 2,
}

impl HandshakeLevel {
    pub fn negotiates(self) -> bool {
        self != Self::None
    }
}

impl TryFrom<u8> for HandshakeLevel {
    type Error = ConfigurationError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::None),
            1 => Ok(Self::Open),
            2 => Ok(Self::Full),
            other => Err(ConfigurationError::InvalidHandshakeLevel(other)),
        }
    }
}

impl From<HandshakeLevel> for u8 {
    fn from(level: HandshakeLevel) -> Self {
        level as u8
    }
}

/// Participant role on a broadcast transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

/// Options governing one port. `auto_close` has no default and must be chosen
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptions {
    pub handshake: HandshakeLevel,
    /// Close once the remote side is gone. Without negotiation this follows
    /// the transport's native close.
    pub auto_close: bool,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default)]
    pub post_awaits_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

fn default_auto_start() -> bool {
    true
}

impl PortOptions {
    pub fn new(handshake: HandshakeLevel, auto_close: bool) -> Self {
        Self {
            handshake,
            auto_close,
            auto_start: true,
            post_awaits_open: false,
            role: None,
        }
    }

    /// Build from a numeric handshake level.
    pub fn from_level(level: u8, auto_close: bool) -> Result<Self, ConfigurationError> {
        Ok(Self::new(HandshakeLevel::try_from(level)?, auto_close))
    }

    /// Options for private plumbing ports (reply channels, bridged sub-ports):
    /// no negotiation and no auto-start. Closing one end closes the other.
    pub fn internal() -> Self {
        Self::new(HandshakeLevel::None, true).auto_start(false)
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn post_awaits_open(mut self, post_awaits_open: bool) -> Self {
        self.post_awaits_open = post_awaits_open;
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

/// Namespace a relay binds to, either shared or split into an inbound and an
/// outbound prefix.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayNamespace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
}

impl RelayNamespace {
    /// No namespace: every event type is relayed as-is.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn shared(namespace: impl Into<String>) -> Result<Self, ConfigurationError> {
        let namespace = validate_namespace(namespace.into())?;
        Ok(Self {
            inbound: Some(namespace.clone()),
            outbound: Some(namespace),
        })
    }

    pub fn split(
        inbound: impl Into<String>,
        outbound: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            inbound: Some(validate_namespace(inbound.into())?),
            outbound: Some(validate_namespace(outbound.into())?),
        })
    }

    /// Event type used for join/leave announcements.
    pub fn announcement_type(&self) -> String {
        namespaced(self.outbound.as_deref(), crate::envelope::MESSAGE_TYPE)
    }
}

pub fn validate_namespace(namespace: String) -> Result<String, ConfigurationError> {
    if namespace.is_empty() {
        return Err(ConfigurationError::EmptyNamespace);
    }
    Ok(namespace)
}

/// `ns:event_type`, or `event_type` unchanged without a namespace.
pub fn namespaced(namespace: Option<&str>, event_type: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}:{event_type}"),
        None => event_type.to_owned(),
    }
}

/// Strip a literal `ns:` prefix. `None` when the type is outside the namespace.
pub fn strip_namespace<'a>(namespace: &str, event_type: &'a str) -> Option<&'a str> {
    event_type
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|rest| !rest.is_empty())
}
