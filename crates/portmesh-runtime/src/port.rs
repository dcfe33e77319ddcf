//! The uniform endpoint.
//!
//! A [`Port`] owns one transport adapter (or, for hubs, a set of member
//! ports) and layers the readiness latches, listener table, forwarding
//! table and teardown set on top of it. All mutable state sits behind a
//! single mutex that is never held while user callbacks run.

use crate::dispose::Disposer;
use crate::event::MessageEvent;
use crate::forward::{EventFilter, ForwardOptions, ForwardingRegistration};
use crate::latch::{LatchWait, ReadyState, ReadyStateQuery, Readiness};
use crate::live::{LiveOptions, LiveValue};
use futures_util::StreamExt;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use portmesh_protocol::{
    CLOSE_EVENT, CONNECT_PING, ConfigurationError, DISCONNECT_PING, ERROR_EVENT, Envelope,
    EventId, HandshakeLevel, MAX_SUB_CHANNELS, MESSAGE_TYPE, MUTATE_SUFFIX, OPEN_EVENT, PortError,
    PortId, PortOptions, PortResult, ProtocolViolation, Role, Transferable, TransportError,
    client_identity, namespaced,
};
use portmesh_transport::{
    LinkKind, Payload, TransportAdapter, TransportEvent, TransportEventStream, TransportMessage,
    channel_pair,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Remove the listener after its first call.
    pub once: bool,
    pub signal: Option<crate::CancelSignal>,
}

impl ListenerOptions {
    pub fn once() -> Self {
        Self {
            once: true,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: crate::CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Per-send envelope settings. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Defaults to `"message"`.
    pub event_type: Option<String>,
    /// Defaults to a fresh id rooted at the event type.
    pub event_id: Option<EventId>,
    pub bubbles: bool,
    pub forwarded: bool,
    pub live: bool,
    pub honour_done: bool,
    pub relayed_from: Option<PortId>,
    pub transfer: Vec<Port>,
}

impl SendOptions {
    pub fn typed(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    pub fn transfer(mut self, ports: Vec<Port>) -> Self {
        self.transfer = ports;
        self
    }
}

#[derive(Clone)]
pub(crate) struct Outbound {
    pub(crate) envelope: Envelope,
    pub(crate) transfer: Vec<Port>,
}

pub(crate) enum Link {
    Transport(Box<dyn TransportAdapter>),
    Hub,
}

struct ListenerEntry {
    id: ListenerId,
    event_type: String,
    once: bool,
    callback: Listener,
}

#[derive(Default)]
pub(crate) struct PortState {
    pub(crate) start_called: bool,
    pub(crate) close_called: bool,
    pub(crate) remote_start: bool,
    pub(crate) remote_close: bool,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
    pub(crate) forwards: Vec<Arc<ForwardingRegistration>>,
    pub(crate) next_forward: u64,
    pub(crate) teardown: Vec<Disposer>,
    pending: VecDeque<Outbound>,
    flushing: bool,
    pub(crate) parent: Option<WeakPort>,
    pub(crate) members: IndexMap<PortId, Port>,
    pub(crate) clients: IndexSet<String>,
    pump: Option<JoinHandle<()>>,
}

pub(crate) struct PortInner {
    pub(crate) id: PortId,
    pub(crate) options: PortOptions,
    pub(crate) link: Link,
    pub(crate) readiness: Readiness,
    pub(crate) state: Mutex<PortState>,
    pub(crate) client_id: Option<String>,
    pub(crate) runtime: Handle,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        if let Some(pump) = self.state.get_mut().pump.take() {
            pump.abort();
        }
    }
}

#[derive(Clone)]
pub struct Port {
    pub(crate) inner: Arc<PortInner>,
}

/// Non-owning reference to a port.
#[derive(Clone, Debug)]
pub struct WeakPort(Weak<PortInner>);

impl WeakPort {
    pub fn upgrade(&self) -> Option<Port> {
        self.0.upgrade().map(|inner| Port { inner })
    }

    pub(crate) fn is(&self, port: &Port) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&port.inner))
    }
}

impl Port {
    /// Wrap a transport adapter. Must be called inside a tokio runtime: the
    /// port spawns a task that reads the adapter's notifications once the
    /// port starts or gains a listener.
    pub fn new(adapter: impl TransportAdapter, options: PortOptions) -> PortResult<Self> {
        let events = adapter.events();
        let port = Self::build(Link::Transport(Box::new(adapter)), options)?;
        if let Some(events) = events {
            let pump = port
                .inner
                .runtime
                .spawn(pump(port.downgrade(), port.inner.readiness.receiving.wait(), events));
            port.inner.state.lock().pump = Some(pump);
        }
        if !port.inner.options.handshake.negotiates() {
            port.mark_open();
        }
        debug!(port_id = %port.id(), handshake = ?port.inner.options.handshake, "port created");
        Ok(port)
    }

    /// Two ports joined by an in-process channel.
    pub fn pair(options: PortOptions) -> PortResult<(Self, Self)> {
        let (left, right) = channel_pair();
        Ok((Self::new(left, options.clone())?, Self::new(right, options)?))
    }

    pub(crate) fn hub(options: PortOptions) -> PortResult<Self> {
        let port = Self::build(Link::Hub, options)?;
        if !port.inner.options.handshake.negotiates() {
            port.mark_open();
        }
        Ok(port)
    }

    fn build(link: Link, options: PortOptions) -> PortResult<Self> {
        let runtime = Handle::try_current().map_err(|_| PortError::NoRuntime)?;
        let client_id = (options.role == Some(Role::Client)).then(client_identity);
        Ok(Self {
            inner: Arc::new(PortInner {
                id: PortId::generate(),
                options,
                link,
                readiness: Readiness::default(),
                state: Mutex::new(PortState::default()),
                client_id,
                runtime,
            }),
        })
    }

    pub fn id(&self) -> &PortId {
        &self.inner.id
    }

    pub fn options(&self) -> &PortOptions {
        &self.inner.options
    }

    pub fn downgrade(&self) -> WeakPort {
        WeakPort(Arc::downgrade(&self.inner))
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.readiness.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.readiness.open.is_fired()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.readiness.closed.is_fired()
    }

    /// Future resolved when the selected latch fires.
    pub fn ready_state_change(&self, query: ReadyStateQuery) -> LatchWait {
        self.inner.readiness.latch(query).wait()
    }

    /// Client identities a server has seen connect and not yet leave.
    pub fn clients(&self) -> Vec<String> {
        self.inner.state.lock().clients.iter().cloned().collect()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.inner.client_id.as_deref()
    }

    pub fn parent(&self) -> Option<Port> {
        self.inner
            .state
            .lock()
            .parent
            .as_ref()
            .and_then(WeakPort::upgrade)
    }

    pub(crate) fn is_server(&self) -> bool {
        self.inner.options.role == Some(Role::Server)
    }

    pub(crate) fn link_kind(&self) -> Option<LinkKind> {
        match &self.inner.link {
            Link::Transport(adapter) => Some(adapter.link_kind()),
            Link::Hub => None,
        }
    }

    pub(crate) fn has_member(&self, id: &PortId) -> bool {
        self.inner.state.lock().members.contains_key(id)
    }

    /// Register a teardown to run once at close. Runs right away if the port
    /// is already closed.
    pub fn defer(&self, disposer: Disposer) {
        {
            let mut state = self.inner.state.lock();
            if !self.is_closed() {
                state.teardown.retain(|spent| !spent.is_disposed());
                state.teardown.push(disposer);
                return;
            }
        }
        disposer.dispose();
    }

    pub fn post_message(&self, payload: Value) -> PortResult<EventId> {
        self.send(payload, SendOptions::default())
    }

    pub fn send(&self, payload: Value, options: SendOptions) -> PortResult<EventId> {
        self.send_inner(payload, options, None)
    }

    /// Send the current state of `value` and keep the receivers' mirrors in
    /// sync with later changes.
    pub fn send_live(&self, value: &LiveValue, mut options: SendOptions) -> PortResult<EventId> {
        options.live = true;
        self.send_inner(value.snapshot(), options, Some(value))
    }

    fn send_inner(
        &self,
        payload: Value,
        options: SendOptions,
        live: Option<&LiveValue>,
    ) -> PortResult<EventId> {
        if self.inner.options.auto_start {
            self.start();
        }
        if self.is_closed() {
            return Err(PortError::Closed(self.id().clone()));
        }
        self.inner.readiness.messaging.fire();

        let event_type = options
            .event_type
            .unwrap_or_else(|| MESSAGE_TYPE.to_owned());
        if event_type.is_empty() {
            return Err(ConfigurationError::EmptyListenerType.into());
        }
        if options.transfer.len() > MAX_SUB_CHANNELS {
            return Err(ProtocolViolation::TooManySubChannels {
                count: options.transfer.len(),
                max: MAX_SUB_CHANNELS,
            }
            .into());
        }
        let event_id = options
            .event_id
            .unwrap_or_else(|| EventId::for_type(&event_type));

        let mut envelope = Envelope::new(event_type, event_id.clone(), payload);
        envelope.live = options.live && envelope.is_structured();
        envelope.honour_done = options.honour_done;
        envelope.bubbles = options.bubbles;
        envelope.forwarded = options.forwarded;
        envelope.relayed_from = options.relayed_from;

        if let Some(value) = live
            && envelope.live
            && !envelope.forwarded
            && !envelope.event_type.ends_with(MUTATE_SUFFIX)
        {
            self.publish(
                value,
                &event_id,
                LiveOptions {
                    honour_done: options.honour_done,
                    signal: None,
                },
            )?;
        }

        self.post(Outbound {
            envelope,
            transfer: options.transfer,
        });
        Ok(event_id)
    }

    /// Queue behind the open latch when configured, otherwise transmit.
    pub(crate) fn post(&self, outbound: Outbound) {
        {
            let mut state = self.inner.state.lock();
            if self.inner.options.post_awaits_open
                && (!self.is_open() || state.flushing || !state.pending.is_empty())
            {
                state.pending.push_back(outbound);
                return;
            }
        }
        self.transmit(outbound);
    }

    pub(crate) fn mark_open(&self) {
        if self.is_closed() || !self.inner.readiness.open.fire() {
            return;
        }
        debug!(port_id = %self.id(), "port open");
        self.dispatch_lifecycle(OPEN_EVENT, Value::Null);
        self.flush_pending();
    }

    fn flush_pending(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.flushing {
                return;
            }
            state.flushing = true;
        }
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                match state.pending.pop_front() {
                    Some(outbound) => outbound,
                    None => {
                        state.flushing = false;
                        break;
                    }
                }
            };
            self.transmit(next);
        }
    }

    pub(crate) fn transmit(&self, outbound: Outbound) {
        let Outbound {
            mut envelope,
            transfer,
        } = outbound;
        match &self.inner.link {
            Link::Hub => {
                let members: Vec<Port> =
                    self.inner.state.lock().members.values().cloned().collect();
                for member in members {
                    if envelope.relayed_from.as_ref() == Some(member.id()) || member.is_closed() {
                        continue;
                    }
                    member.post(Outbound {
                        envelope: envelope.clone(),
                        transfer: transfer.clone(),
                    });
                }
            }
            Link::Transport(adapter) => {
                let handles = if transfer.is_empty() {
                    Vec::new()
                } else if adapter.native_transfer() {
                    transfer.into_iter().map(Transferable::new).collect()
                } else {
                    self.virtualize(&mut envelope, transfer);
                    Vec::new()
                };
                let sent = envelope
                    .encode()
                    .map_err(|error| TransportError::Encode(error.to_string()))
                    .and_then(|wire| {
                        adapter.send(TransportMessage::structured(wire).with_transfer(handles))
                    });
                match sent {
                    Ok(()) => debug!(
                        port_id = %self.id(),
                        event_type = %envelope.event_type,
                        "envelope sent"
                    ),
                    Err(error) => self.report_error(error),
                }
            }
        }
    }

    /// Bridge each transferred port into this link under `<event_id>:<i>`.
    fn virtualize(&self, envelope: &mut Envelope, transfer: Vec<Port>) {
        envelope.sub_channel_count = Some(transfer.len());
        for (index, port) in transfer.into_iter().enumerate() {
            let namespace = envelope.event_id.sub_channel_namespace(index);
            if let Err(error) = self.bridge(&port, namespace, &port, vec![port.clone()]) {
                warn!(port_id = %self.id(), %error, "failed bridging sub-channel");
            }
        }
    }

    /// Forward `target` both ways under `namespace` until `watched` closes or
    /// the other side sends `<namespace>:close`. Either end going away tears
    /// the bridge down and closes `closing`; a local close is announced.
    fn bridge(
        &self,
        target: &Port,
        namespace: String,
        watched: &Port,
        closing: Vec<Port>,
    ) -> PortResult<()> {
        let forward = self.forward_port(
            EventFilter::Any,
            target,
            ForwardOptions::bidirectional().inbound(namespace.clone()),
        )?;
        let signal = crate::CancelSignal::new();
        let teardown = {
            let signal = signal.clone();
            Disposer::new(move || {
                signal.cancel();
                forward.dispose();
                for port in closing {
                    port.close();
                }
            })
        };

        let close_type = namespaced(Some(namespace.as_str()), CLOSE_EVENT);
        let remote = teardown.clone();
        self.listen(
            &close_type,
            ListenerOptions::once().with_signal(signal),
            move |_| remote.dispose(),
        );
        let link = self.downgrade();
        let local = teardown.clone();
        watched.inner.readiness.closed.on_fire(move || {
            if local.is_disposed() {
                return;
            }
            if let Some(link) = link.upgrade()
                && !link.is_closed()
            {
                let event_id = EventId::for_type(&close_type);
                link.post(Outbound {
                    envelope: Envelope::new(close_type, event_id, Value::Null),
                    transfer: Vec::new(),
                });
            }
            local.dispose();
        });
        self.defer(teardown);
        Ok(())
    }

    pub(crate) fn report_error(&self, error: TransportError) {
        warn!(port_id = %self.id(), %error, "transport error");
        self.inner.readiness.error.fire();
        self.dispatch_lifecycle(ERROR_EVENT, json!({ "message": error.to_string() }));
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.receive(message),
            TransportEvent::Error(error) => self.report_error(error),
            TransportEvent::Open => {
                let native_open =
                    matches!(&self.inner.link, Link::Transport(adapter) if adapter.native_open());
                if native_open && self.inner.options.handshake == HandshakeLevel::Open {
                    self.remote_started();
                }
            }
            TransportEvent::Close => {
                if self.inner.options.handshake.negotiates() || self.inner.options.auto_close {
                    self.close_remote();
                } else {
                    debug!(port_id = %self.id(), "native close ignored without negotiation");
                }
            }
        }
    }

    fn receive(&self, message: TransportMessage) {
        let Link::Transport(adapter) = &self.inner.link else {
            return;
        };
        let message = adapter.hydrate_message(message);
        let value = match message.data {
            Payload::Structured(value) => value,
            Payload::Text(text) => Value::String(text),
        };
        let envelope = Envelope::decode(value);
        if let Some(count) = envelope.sub_channel_count
            && count > MAX_SUB_CHANNELS
        {
            let violation = ProtocolViolation::TooManySubChannels {
                count,
                max: MAX_SUB_CHANNELS,
            };
            warn!(
                port_id = %self.id(),
                event_type = %envelope.event_type,
                %violation,
                "envelope dropped"
            );
            return;
        }
        let ports = match envelope.sub_channel_count {
            Some(count) if !adapter.native_transfer() => (0..count)
                .filter_map(|index| match self.bridge_sub_channel(&envelope.event_id, index) {
                    Ok(port) => Some(port),
                    Err(error) => {
                        warn!(port_id = %self.id(), %error, "failed materializing sub-channel");
                        None
                    }
                })
                .collect(),
            _ => message
                .transfer
                .iter()
                .filter_map(|handle| handle.downcast_ref::<Port>().cloned())
                .collect(),
        };

        match envelope.event_type.as_str() {
            CONNECT_PING => return self.on_connect_ping(&envelope, ports),
            DISCONNECT_PING => return self.on_disconnect_ping(&envelope),
            _ => {}
        }

        let live = (envelope.live && envelope.is_structured()).then(|| {
            let mirror = LiveValue::new(envelope.payload.clone());
            self.subscribe(
                &mirror,
                &envelope.event_id,
                LiveOptions {
                    honour_done: envelope.honour_done,
                    signal: None,
                },
            );
            mirror
        });
        let event = MessageEvent::new(envelope, ports, self.id().clone(), live);
        self.dispatch(&event);
    }

    /// Materialize the `index`-th virtualized sub-channel of `event_id`.
    fn bridge_sub_channel(&self, event_id: &EventId, index: usize) -> PortResult<Port> {
        let (near, far) = Self::pair(PortOptions::internal())?;
        let closing = vec![near.clone(), far.clone()];
        self.bridge(&near, event_id.sub_channel_namespace(index), &near, closing)?;
        Ok(far)
    }

    /// Run listeners, then bubble to the parent and walk the forwarding table.
    pub(crate) fn dispatch(&self, event: &MessageEvent) {
        self.call_listeners(event);
        if event.is_propagation_stopped() {
            return;
        }
        let parent = self.parent();
        if let Some(parent) = parent
            && (event.bubbles() || parent.has_member(self.id()))
        {
            parent.dispatch(event);
        }
        if event.is_propagation_stopped() {
            return;
        }
        self.run_forwards(event);
    }

    /// Lifecycle notifications reach local listeners only.
    pub(crate) fn dispatch_lifecycle(&self, event_type: &str, payload: Value) {
        let event = MessageEvent::lifecycle(event_type, self.id().clone(), payload);
        self.call_listeners(&event);
    }

    fn call_listeners(&self, event: &MessageEvent) {
        let listeners: Vec<Listener> = {
            let mut state = self.inner.state.lock();
            let matching = state
                .listeners
                .iter()
                .filter(|entry| entry.event_type == event.event_type())
                .map(|entry| Arc::clone(&entry.callback))
                .collect();
            state
                .listeners
                .retain(|entry| !(entry.once && entry.event_type == event.event_type()));
            matching
        };
        for listener in listeners {
            listener(event);
            if event.is_immediate_propagation_stopped() {
                break;
            }
        }
    }

    pub fn add_event_listener(
        &self,
        event_type: &str,
        options: ListenerOptions,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> PortResult<ListenerId> {
        if event_type.is_empty() {
            return Err(ConfigurationError::EmptyListenerType.into());
        }
        let id = self.listen(event_type, options, listener);
        if self.inner.options.auto_start {
            self.start();
        }
        Ok(id)
    }

    /// Register without auto-starting.
    pub(crate) fn listen(
        &self,
        event_type: &str,
        options: ListenerOptions,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.readiness.receiving.fire();
        let id = {
            let mut state = self.inner.state.lock();
            state.next_listener += 1;
            let id = ListenerId(state.next_listener);
            state.listeners.push(ListenerEntry {
                id,
                event_type: event_type.to_owned(),
                once: options.once,
                callback: Arc::new(listener),
            });
            id
        };
        if let Some(signal) = options.signal {
            let weak = self.downgrade();
            signal.on_cancel(move || {
                if let Some(port) = weak.upgrade() {
                    port.remove_event_listener(id);
                }
            });
        }
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|entry| entry.id != id);
        state.listeners.len() != before
    }

    pub(crate) fn finish_close(&self) {
        if !self.inner.readiness.closed.fire() {
            return;
        }
        let remote = self.inner.state.lock().remote_close;
        debug!(port_id = %self.id(), remote, "port closed");
        self.dispatch_lifecycle(CLOSE_EVENT, Value::Null);
        let (teardown, pump) = {
            let mut state = self.inner.state.lock();
            state.forwards.clear();
            state.pending.clear();
            state.listeners.clear();
            (std::mem::take(&mut state.teardown), state.pump.take())
        };
        for disposer in teardown {
            disposer.dispose();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

async fn pump(port: WeakPort, receiving: LatchWait, mut events: TransportEventStream) {
    receiving.await;
    while let Some(event) = events.next().await {
        let Some(port) = port.upgrade() else {
            return;
        };
        port.handle_transport_event(event);
    }
    if let Some(port) = port.upgrade() {
        port.handle_transport_event(TransportEvent::Close);
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", self.id())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Port {}
