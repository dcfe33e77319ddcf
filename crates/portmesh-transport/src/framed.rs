//! Text-frame links.
//!
//! Frames are strings, so structured data is serialized on send and only
//! marker-wrapped frames are parsed back on receive. Each end raises a
//! native open signal as soon as it exists.

use crate::{
    LinkKind, Payload, TransportAdapter, TransportEvent, TransportEventStream, TransportMessage,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use portmesh_protocol::{Envelope, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Debug)]
pub struct FramedEndpoint {
    name: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

pub fn framed_pair() -> (FramedEndpoint, FramedEndpoint) {
    let (to_right, from_left) = mpsc::unbounded_channel();
    let (to_left, from_right) = mpsc::unbounded_channel();
    let _ = to_left.send(TransportEvent::Open);
    let _ = to_right.send(TransportEvent::Open);
    let left = FramedEndpoint {
        name: "framed".to_owned(),
        outbound: Mutex::new(Some(to_right)),
        inbound: Mutex::new(Some(from_right)),
    };
    let right = FramedEndpoint {
        name: "framed".to_owned(),
        outbound: Mutex::new(Some(to_left)),
        inbound: Mutex::new(Some(from_left)),
    };
    (left, right)
}

fn to_frame(data: Payload) -> Result<String, TransportError> {
    match data {
        Payload::Text(text) => Ok(text),
        Payload::Structured(value) => {
            serde_json::to_string(&value).map_err(|error| TransportError::Encode(error.to_string()))
        }
    }
}

impl TransportAdapter for FramedEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::PointToPoint
    }

    fn native_open(&self) -> bool {
        true
    }

    fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        if !message.transfer.is_empty() {
            return Err(TransportError::Encode(
                "text frames cannot carry transferred handles".to_owned(),
            ));
        }
        let frame = to_frame(message.data)?;
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::Disconnected)?;
        sender
            .send(TransportEvent::Message(TransportMessage::new(Payload::Text(
                frame,
            ))))
            .map_err(|_| TransportError::Disconnected)
    }

    fn events(&self) -> Option<TransportEventStream> {
        let receiver = self.inbound.lock().take()?;
        Some(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn close(&self) {
        if let Some(sender) = self.outbound.lock().take() {
            let _ = sender.send(TransportEvent::Close);
            debug!(transport = %self.name, "framed endpoint closed");
        }
    }

    fn hydrate_message(&self, message: TransportMessage) -> TransportMessage {
        let Payload::Text(text) = &message.data else {
            return message;
        };
        match serde_json::from_str::<Value>(text) {
            Ok(value) if Envelope::is_wire_shaped(&value) => TransportMessage {
                data: Payload::Structured(value),
                transfer: message.transfer,
            },
            _ => message,
        }
    }
}
