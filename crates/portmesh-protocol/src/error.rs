//! Error taxonomy for portmesh.

use crate::ids::PortId;
use thiserror::Error;

/// Invalid configuration, raised synchronously at construction or call time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid handshake level {0}: expected 0, 1 or 2")]
    InvalidHandshakeLevel(u8),
    #[error("namespace must be a non-empty string")]
    EmptyNamespace,
    #[error("event filter must name at least one event type")]
    EmptyFilter,
    #[error("listener type must be a non-empty string")]
    EmptyListenerType,
    #[error("live replication requires an object or array value")]
    NotStructured,
}

/// Violations of the port graph shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("port {port} already has a bubbling parent")]
    AlreadyParented { port: PortId },
    #[error("cannot add port to hub {hub}: hub is closed")]
    HubClosed { hub: PortId },
    #[error("hub {0} cannot be attached to itself")]
    SelfAttachment(PortId),
    #[error("cannot attach port {port}: port is closed")]
    MemberClosed { port: PortId },
}

/// Malformed data reaching replication apply. The offending batch is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("malformed mutation batch: {0}")]
    MalformedBatch(String),
    #[error("invalid mutation path: {0}")]
    InvalidPath(String),
    #[error("type conflict at path {path}: expected {expected}")]
    TypeConflict {
        path: String,
        expected: &'static str,
    },
    #[error("invalid arguments for {method} at path {path}")]
    InvalidArguments { method: String, path: String },
    #[error("{count} sub-channels exceed the limit of {max}")]
    TooManySubChannels { count: usize, max: usize },
}

/// Adapter-level failure. Surfaced through the `error` notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport peer disconnected")]
    Disconnected,
    #[error("receiver lagged behind and skipped {0} messages")]
    Lagged(u64),
    #[error("failed encoding frame: {0}")]
    Encode(String),
    #[error("failed decoding frame: {0}")]
    Decode(String),
}

/// Errors returned by port operations.
#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("port {0} is closed")]
    Closed(PortId),
    #[error("request cancelled before a response arrived")]
    RequestCancelled,
    #[error("ports must be created inside a tokio runtime")]
    NoRuntime,
}

/// Convenience result type for port operations.
pub type PortResult<T> = Result<T, PortError>;
