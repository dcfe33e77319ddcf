//! # portmesh-transport: the boundary between ports and raw primitives
//!
//! A [`TransportAdapter`] wraps one underlying message primitive. Ports only
//! ever talk to this trait, which keeps the runtime free of transport
//! branching.
//!
//! - [`channel`]: connected in-process pairs with native transfer
//! - [`bus`]: named many-to-many broadcast bus
//! - [`framed`]: text-frame links that model a socket

pub mod bus;
pub mod channel;
pub mod framed;

use futures_util::stream::BoxStream;
use portmesh_protocol::{Transferable, TransportError};
use serde_json::Value;

pub use bus::{BroadcastBus, BusEndpoint};
pub use channel::{ChannelEndpoint, channel_pair};
pub use framed::{FramedEndpoint, framed_pair};

/// Raw data as the primitive carries it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Structured(Value),
    /// An unparsed text frame. Adapters hydrate these in
    /// [`TransportAdapter::hydrate_message`].
    Text(String),
}

#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub data: Payload,
    pub transfer: Vec<Transferable>,
}

impl TransportMessage {
    pub fn new(data: Payload) -> Self {
        Self {
            data,
            transfer: Vec::new(),
        }
    }

    pub fn structured(value: Value) -> Self {
        Self::new(Payload::Structured(value))
    }

    pub fn with_transfer(mut self, transfer: Vec<Transferable>) -> Self {
        self.transfer = transfer;
        self
    }
}

/// Notifications raised by the underlying primitive.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(TransportMessage),
    Error(TransportError),
    /// Native open signal, for primitives that have one.
    Open,
    /// Native close signal. A finished stream means the same thing.
    Close,
}

pub type TransportEventStream = BoxStream<'static, TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Exactly one remote peer.
    PointToPoint,
    /// Any number of anonymous participants hear every message.
    Broadcast,
}

pub trait TransportAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn link_kind(&self) -> LinkKind;

    /// Whether transferred handles survive the trip unchanged. Links without
    /// it get sub-channels virtualized over the parent link instead.
    fn native_transfer(&self) -> bool {
        false
    }

    /// Whether the primitive raises [`TransportEvent::Open`] on its own.
    fn native_open(&self) -> bool {
        false
    }

    fn send(&self, message: TransportMessage) -> Result<(), TransportError>;

    /// The inbound notification stream. Yields `Some` exactly once.
    fn events(&self) -> Option<TransportEventStream>;

    fn start(&self) {}

    fn close(&self);

    /// Convert raw inbound data into its structured form, when it has one.
    fn hydrate_message(&self, message: TransportMessage) -> TransportMessage {
        message
    }
}
