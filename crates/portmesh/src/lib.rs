//! Uniform message ports over heterogeneous transports.
//!
//! Re-exports the wire contract ([`protocol`]), the bundled adapters
//! ([`transport`]) and the port runtime. Most users only need the prelude.

pub use portmesh_protocol as protocol;
pub use portmesh_runtime as runtime;
pub use portmesh_transport as transport;

pub mod prelude {
    pub use portmesh_protocol::{
        HandshakeLevel, MESSAGE_TYPE, PortError, PortOptions, PortResult, RelayNamespace, Role,
    };
    pub use portmesh_runtime::{
        CancelSignal, Disposer, EventFilter, ForwardOptions, Hub, ListenerOptions, LiveValue,
        MembershipOptions, MessageEvent, Port, ReadyState, ReadyStateQuery, Relay,
        RelayMemberOptions, RequestOptions, SendOptions,
    };
    pub use portmesh_transport::{BroadcastBus, TransportAdapter, channel_pair, framed_pair};
}
