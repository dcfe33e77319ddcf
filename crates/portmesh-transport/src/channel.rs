//! Connected in-process endpoint pairs.

use crate::{LinkKind, TransportAdapter, TransportEvent, TransportEventStream, TransportMessage};
use futures_util::StreamExt;
use parking_lot::Mutex;
use portmesh_protocol::TransportError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// One end of a [`channel_pair`]. Handles in a message's transfer list are
/// delivered as-is.
#[derive(Debug)]
pub struct ChannelEndpoint {
    name: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

pub fn channel_pair() -> (ChannelEndpoint, ChannelEndpoint) {
    let (to_right, from_left) = mpsc::unbounded_channel();
    let (to_left, from_right) = mpsc::unbounded_channel();
    let left = ChannelEndpoint {
        name: "channel".to_owned(),
        outbound: Mutex::new(Some(to_right)),
        inbound: Mutex::new(Some(from_right)),
    };
    let right = ChannelEndpoint {
        name: "channel".to_owned(),
        outbound: Mutex::new(Some(to_left)),
        inbound: Mutex::new(Some(from_left)),
    };
    (left, right)
}

impl TransportAdapter for ChannelEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::PointToPoint
    }

    fn native_transfer(&self) -> bool {
        true
    }

    fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::Disconnected)?;
        sender
            .send(TransportEvent::Message(message))
            .map_err(|_| TransportError::Disconnected)
    }

    fn events(&self) -> Option<TransportEventStream> {
        let receiver = self.inbound.lock().take()?;
        Some(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn close(&self) {
        if let Some(sender) = self.outbound.lock().take() {
            let _ = sender.send(TransportEvent::Close);
            debug!(transport = %self.name, "channel endpoint closed");
        }
    }
}
