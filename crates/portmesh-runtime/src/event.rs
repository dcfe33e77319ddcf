//! Listener-facing view of a dispatched envelope.

use crate::live::LiveValue;
use crate::port::{Port, SendOptions};
use portmesh_protocol::{Envelope, EventId, PortId};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A received envelope plus everything materialized alongside it. Cheap to
/// clone; clones share propagation flags.
#[derive(Clone)]
pub struct MessageEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    envelope: Envelope,
    ports: Vec<Port>,
    origin: PortId,
    live: Option<LiveValue>,
    propagation_stopped: AtomicBool,
    immediate_propagation_stopped: AtomicBool,
}

impl MessageEvent {
    pub(crate) fn new(
        envelope: Envelope,
        ports: Vec<Port>,
        origin: PortId,
        live: Option<LiveValue>,
    ) -> Self {
        Self {
            inner: Arc::new(EventInner {
                envelope,
                ports,
                origin,
                live,
                propagation_stopped: AtomicBool::new(false),
                immediate_propagation_stopped: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn lifecycle(event_type: &str, origin: PortId, payload: Value) -> Self {
        Self::new(
            Envelope::new(event_type, EventId::for_type(event_type), payload),
            Vec::new(),
            origin,
            None,
        )
    }

    pub fn envelope(&self) -> &Envelope {
        &self.inner.envelope
    }

    pub fn event_type(&self) -> &str {
        &self.inner.envelope.event_type
    }

    pub fn event_id(&self) -> &EventId {
        &self.inner.envelope.event_id
    }

    /// The payload as it arrived. For live envelopes this is the initial
    /// state; [`MessageEvent::live`] tracks later changes.
    pub fn data(&self) -> &Value {
        &self.inner.envelope.payload
    }

    pub fn ports(&self) -> &[Port] {
        &self.inner.ports
    }

    /// Port that first dispatched this event.
    pub fn origin(&self) -> &PortId {
        &self.inner.origin
    }

    pub fn live(&self) -> Option<&LiveValue> {
        self.inner.live.as_ref()
    }

    pub fn is_forwarded(&self) -> bool {
        self.inner.envelope.forwarded
    }

    pub fn bubbles(&self) -> bool {
        self.inner.envelope.bubbles
    }

    pub fn relayed_from(&self) -> Option<&PortId> {
        self.inner.envelope.relayed_from.as_ref()
    }

    /// Post `payload` on every attached port. Returns whether any accepted it.
    pub fn respond_with(&self, payload: Value) -> bool {
        let mut delivered = false;
        for port in &self.inner.ports {
            match port.send(payload.clone(), SendOptions::default()) {
                Ok(_) => delivered = true,
                Err(error) => debug!(port_id = %port.id(), %error, "reply port refused response"),
            }
        }
        delivered
    }

    /// Stop bubbling and forwarding after the current port's listeners.
    pub fn stop_propagation(&self) {
        self.inner.propagation_stopped.store(true, Ordering::Release);
    }

    /// Also skip the remaining listeners on the current port.
    pub fn stop_immediate_propagation(&self) {
        self.stop_propagation();
        self.inner
            .immediate_propagation_stopped
            .store(true, Ordering::Release);
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.inner.propagation_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn is_immediate_propagation_stopped(&self) -> bool {
        self.inner
            .immediate_propagation_stopped
            .load(Ordering::Acquire)
    }
}

impl fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("type", &self.event_type())
            .field("event_id", self.event_id())
            .field("ports", &self.inner.ports.len())
            .field("live", &self.inner.live.is_some())
            .finish()
    }
}
