//! # portmesh-protocol: wire contract for portmesh
//!
//! Shared types for every portmesh crate: ids, the marker-wrapped message
//! envelope, port options, replication records and the error taxonomy.
//!
//! Runtime-free (no tokio) so transports and tools can depend on it alone.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (PortId, EventId)
//! - [`envelope`]: Envelope, control pings, reserved event types
//! - [`options`]: PortOptions, HandshakeLevel, Role, RelayNamespace
//! - [`mutation`]: MutationRecord batches and their application
//! - [`transfer`]: Transferable handles for native-transfer transports
//! - [`error`]: PortError and its families, PortResult

pub mod envelope;
pub mod error;
pub mod ids;
pub mod mutation;
pub mod options;
pub mod transfer;

pub use envelope::{
    CLOSE_EVENT, CONNECT_PING, ControlPing, DISCONNECT_PING, ERROR_EVENT, Envelope,
    MAX_SUB_CHANNELS, MESSAGE_TYPE, MUTATE_SUFFIX, OPEN_EVENT, SERVER_IDENTITY, WIRE_MARKER,
};
pub use error::{
    ConfigurationError, PortError, PortResult, ProtocolViolation, TopologyError, TransportError,
};
pub use ids::{EventId, PortId, client_identity};
pub use mutation::{
    ArrayMethod, MAX_SPARSE_GAP, MutationOp, MutationRecord, apply_batch, apply_record,
    decode_batch, pointer_segment,
};
pub use options::{
    HandshakeLevel, PortOptions, RelayNamespace, Role, namespaced, strip_namespace,
    validate_namespace,
};
pub use transfer::Transferable;
