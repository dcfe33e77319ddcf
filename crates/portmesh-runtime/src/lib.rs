//! # portmesh-runtime: the port protocol stack
//!
//! [`Port`] normalizes open/close semantics over any
//! [`TransportAdapter`](portmesh_transport::TransportAdapter), carries
//! sub-ports inside ordinary messages when the transport cannot move them
//! natively, and composes into hub and relay topologies. Live values
//! replicate their mutations across a port pair.
//!
//! Every port must be created inside a tokio runtime.
//!
//! ## Module Overview
//!
//! - [`port`]: Port, send/listen, hydration of incoming envelopes
//! - [`handshake`]: connect/disconnect negotiation and close
//! - [`latch`]: one-shot readiness latches and cancel signals
//! - [`forward`]: forwarding registrations, filters and resolvers
//! - [`hub`] / [`relay`]: star and namespace-bridge topologies
//! - [`live`]: replicated values and mutation batches
//! - [`request`]: request/response over private reply channels

pub mod dispose;
pub mod event;
pub mod forward;
pub mod handshake;
pub mod hub;
pub mod latch;
pub mod live;
pub mod port;
pub mod relay;
pub mod request;

pub use dispose::Disposer;
pub use event::MessageEvent;
pub use forward::{EventFilter, ForwardOptions, Resolver};
pub use hub::{Hub, MembershipOptions};
pub use latch::{CancelSignal, Latch, LatchWait, ReadyState, ReadyStateQuery};
pub use live::{LiveOptions, LiveValue, Transaction};
pub use port::{ListenerId, ListenerOptions, Port, SendOptions, WeakPort};
pub use relay::{Relay, RelayMemberOptions};
pub use request::{RequestHandler, RequestOptions};
