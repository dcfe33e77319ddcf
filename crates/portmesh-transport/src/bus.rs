//! Named many-to-many bus over `tokio::sync::broadcast`.
//!
//! Every endpoint joined to a bus hears every message sent by the others,
//! never its own.

use crate::{LinkKind, TransportAdapter, TransportEvent, TransportEventStream, TransportMessage};
use futures_util::{StreamExt, future};
use parking_lot::Mutex;
use portmesh_protocol::TransportError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct BusFrame {
    from: u64,
    message: TransportMessage,
}

#[derive(Clone, Debug)]
pub struct BroadcastBus {
    name: Arc<str>,
    sender: broadcast::Sender<BusFrame>,
    next_endpoint: Arc<AtomicU64>,
}

impl BroadcastBus {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: Arc::from(name.into()),
            sender,
            next_endpoint: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the bus. The endpoint hears messages sent from this point on.
    pub fn join(&self) -> BusEndpoint {
        BusEndpoint {
            id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            name: self.name.to_string(),
            sender: self.sender.clone(),
            receiver: Mutex::new(Some(self.sender.subscribe())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn participants(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug)]
pub struct BusEndpoint {
    id: u64,
    name: String,
    sender: broadcast::Sender<BusFrame>,
    receiver: Mutex<Option<broadcast::Receiver<BusFrame>>>,
    closed: AtomicBool,
}

impl TransportAdapter for BusEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::Broadcast
    }

    fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        // Nobody listening is not an error on a bus.
        let _ = self.sender.send(BusFrame {
            from: self.id,
            message,
        });
        Ok(())
    }

    fn events(&self) -> Option<TransportEventStream> {
        let receiver = self.receiver.lock().take()?;
        let own_id = self.id;
        let name = self.name.clone();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = match item {
                Ok(frame) if frame.from == own_id => None,
                Ok(frame) => Some(TransportEvent::Message(frame.message)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(bus = %name, skipped, "bus endpoint lagged");
                    Some(TransportEvent::Error(TransportError::Lagged(skipped)))
                }
            };
            future::ready(event)
        });
        Some(stream.boxed())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.receiver.lock().take();
            debug!(bus = %self.name, endpoint = self.id, "left bus");
        }
    }
}
