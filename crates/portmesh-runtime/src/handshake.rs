//! Open and close negotiation.
//!
//! A connect ping carries one transferred acknowledgment port. The receiver
//! replies on it and opens; the sender opens on the first reply. Disconnect
//! pings mirror this for close at [`HandshakeLevel::Full`]. On broadcast
//! links with a [`Role`], the reply and ping payloads carry participant
//! identities so a server can track its clients.

use crate::port::{Link, ListenerOptions, Outbound, Port, SendOptions};
use futures_util::future::join_all;
use portmesh_protocol::{
    CONNECT_PING, ControlPing, DISCONNECT_PING, Envelope, EventId, HandshakeLevel, MESSAGE_TYPE,
    PortOptions, Role, SERVER_IDENTITY,
};
use portmesh_transport::LinkKind;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

impl Port {
    /// Begin negotiation. Idempotent.
    #[instrument(skip(self), fields(port_id = %self.id()))]
    pub fn start(&self) {
        if self.is_open() || self.is_closed() {
            return;
        }
        let (first_call, remote_started) = {
            let mut state = self.inner.state.lock();
            let first_call = !state.start_called;
            state.start_called = true;
            (first_call, state.remote_start)
        };
        if first_call {
            self.inner.readiness.receiving.fire();
            if let Link::Transport(adapter) = &self.inner.link {
                adapter.start();
            }
            debug!("port starting");
        }
        if remote_started {
            self.mark_open();
            return;
        }
        if !first_call {
            return;
        }
        match &self.inner.link {
            Link::Hub => self.mark_open(),
            Link::Transport(adapter) => match self.inner.options.handshake {
                HandshakeLevel::None => self.mark_open(),
                HandshakeLevel::Open if adapter.native_open() => {
                    debug!("waiting for native open");
                }
                HandshakeLevel::Open | HandshakeLevel::Full => self.send_connect_ping(),
            },
        }
    }

    /// The remote side showed up first: treat that as a completed round trip.
    pub(crate) fn remote_started(&self) {
        self.inner.state.lock().remote_start = true;
        self.start();
    }

    fn identity(&self) -> Option<String> {
        match self.inner.options.role {
            Some(Role::Server) => Some(SERVER_IDENTITY.to_owned()),
            Some(Role::Client) => self.inner.client_id.clone(),
            None => None,
        }
    }

    fn control_envelope(&self, event_type: &str) -> Envelope {
        let ping = ControlPing {
            id: self.identity(),
        };
        Envelope::new(event_type, EventId::for_type(event_type), ping.to_payload())
    }

    fn send_connect_ping(&self) {
        let (ack_local, ack_remote) = match Port::pair(PortOptions::internal()) {
            Ok(pair) => pair,
            Err(error) => {
                warn!(port_id = %self.id(), %error, "cannot create acknowledgment channel");
                return;
            }
        };
        let (local, remote) = (ack_local.clone(), ack_remote.clone());
        let release = crate::Disposer::new(move || {
            local.close();
            remote.close();
        });
        let weak = self.downgrade();
        let acknowledged = release.clone();
        ack_local.listen(MESSAGE_TYPE, ListenerOptions::once(), move |event| {
            if let Some(port) = weak.upgrade() {
                if port.is_server()
                    && let Some(client) = event.data().as_str()
                {
                    port.inner.state.lock().clients.insert(client.to_owned());
                }
                debug!(port_id = %port.id(), "connect acknowledged");
                port.mark_open();
            }
            acknowledged.dispose();
        });
        self.defer(release);
        self.transmit(Outbound {
            envelope: self.control_envelope(CONNECT_PING),
            transfer: vec![ack_remote],
        });
    }

    pub(crate) fn on_connect_ping(&self, envelope: &Envelope, ports: Vec<Port>) {
        let ping = ControlPing::from_payload(&envelope.payload);
        let reply = match (self.link_kind(), self.inner.options.role) {
            (Some(LinkKind::Broadcast), Some(Role::Server)) => {
                if let Some(client) = ping.id {
                    self.inner.state.lock().clients.insert(client);
                }
                json!(SERVER_IDENTITY)
            }
            (Some(LinkKind::Broadcast), Some(Role::Client))
                if ping.id.as_deref() == Some(SERVER_IDENTITY) =>
            {
                self.inner
                    .client_id
                    .clone()
                    .map_or(Value::Bool(true), Value::String)
            }
            _ => Value::Bool(true),
        };
        debug!(port_id = %self.id(), "connect ping received");
        self.remote_started();
        for port in ports {
            if let Err(error) = port.send(reply.clone(), SendOptions::default()) {
                debug!(port_id = %self.id(), %error, "acknowledgment not delivered");
            }
        }
    }

    pub(crate) fn on_disconnect_ping(&self, envelope: &Envelope) {
        let ping = ControlPing::from_payload(&envelope.payload);
        match (self.link_kind(), self.inner.options.role) {
            (Some(LinkKind::Broadcast), Some(Role::Server)) => {
                let (removed, remaining) = {
                    let mut state = self.inner.state.lock();
                    let removed = ping
                        .id
                        .as_ref()
                        .is_some_and(|client| state.clients.shift_remove(client));
                    (removed, state.clients.len())
                };
                debug!(port_id = %self.id(), removed, remaining, "client left");
                if removed && remaining == 0 && self.inner.options.auto_close {
                    self.close_remote();
                }
            }
            (Some(LinkKind::Broadcast), Some(Role::Client)) => {
                if ping.id.as_deref() == Some(SERVER_IDENTITY) {
                    self.close_remote();
                }
            }
            (Some(LinkKind::Broadcast), None) => {
                debug!(port_id = %self.id(), "disconnect ping ignored outside client/server mode");
            }
            _ => self.close_remote(),
        }
    }

    /// Tear the port down. Idempotent.
    #[instrument(skip(self), fields(port_id = %self.id()))]
    pub fn close(&self) {
        self.close_with(false);
    }

    /// Close in response to the remote side leaving; no disconnect ping.
    pub(crate) fn close_remote(&self) {
        self.close_with(true);
    }

    fn close_with(&self, remote: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.close_called {
                return;
            }
            state.close_called = true;
            state.remote_close = remote;
        }
        match &self.inner.link {
            Link::Transport(adapter) => {
                if self.inner.options.handshake == HandshakeLevel::Full && !remote {
                    self.transmit(Outbound {
                        envelope: self.control_envelope(DISCONNECT_PING),
                        transfer: Vec::new(),
                    });
                }
                adapter.close();
                self.finish_close();
            }
            Link::Hub => {
                let members: Vec<Port> =
                    self.inner.state.lock().members.values().cloned().collect();
                for member in &members {
                    member.close();
                }
                let outstanding: Vec<_> = members
                    .iter()
                    .filter(|member| !member.is_closed())
                    .map(|member| member.inner.readiness.closed.wait())
                    .collect();
                if outstanding.is_empty() {
                    info!(port_id = %self.id(), members = members.len(), "hub closed");
                    self.finish_close();
                    return;
                }
                let hub = self.clone();
                self.inner.runtime.spawn(async move {
                    join_all(outstanding).await;
                    info!(port_id = %hub.id(), "hub closed after members");
                    hub.finish_close();
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::port::{ListenerOptions, Port};
    use crate::{ReadyState, ReadyStateQuery};
    use portmesh_protocol::{HandshakeLevel, MESSAGE_TYPE, PortOptions, Role};
    use portmesh_transport::{BroadcastBus, framed_pair};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    async fn opened(port: &Port) {
        timeout(WAIT, port.ready_state_change(ReadyStateQuery::Open))
            .await
            .expect("port did not open");
    }

    async fn closed(port: &Port) {
        timeout(WAIT, port.ready_state_change(ReadyStateQuery::Closed))
            .await
            .expect("port did not close");
    }

    #[tokio::test]
    async fn pairs_open_at_every_level() {
        for level in 0..=2 {
            let options = PortOptions::from_level(level, false).unwrap();
            let (a, b) = Port::pair(options).unwrap();
            a.start();
            b.start();
            opened(&a).await;
            opened(&b).await;
            assert_eq!(a.ready_state(), ReadyState::Open);
            assert_eq!(b.ready_state(), ReadyState::Open);
        }
    }

    #[tokio::test]
    async fn open_latch_fires_once() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::Full, false)).unwrap();
        let (sender, mut opens) = mpsc::unbounded_channel();
        a.add_event_listener("open", ListenerOptions::default(), move |_| {
            let _ = sender.send(());
        })
        .unwrap();
        b.start();
        opened(&a).await;
        opened(&b).await;
        a.start();
        sleep(Duration::from_millis(30)).await;
        assert!(opens.recv().await.is_some());
        assert!(opens.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_ping_opens_a_port_that_never_started() {
        let options = PortOptions::new(HandshakeLevel::Full, false).auto_start(false);
        let (a, b) = Port::pair(options).unwrap();
        b.add_event_listener(MESSAGE_TYPE, ListenerOptions::default(), |_| {})
            .unwrap();
        a.start();
        opened(&a).await;
        opened(&b).await;
    }

    #[tokio::test]
    async fn full_handshake_closes_the_peer() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::Full, false)).unwrap();
        a.start();
        b.start();
        opened(&a).await;
        opened(&b).await;
        a.close();
        a.close();
        closed(&b).await;
    }

    #[tokio::test]
    async fn framed_link_opens_natively_and_closes_natively() {
        let (left, right) = framed_pair();
        let options = PortOptions::new(HandshakeLevel::Open, false);
        let a = Port::new(left, options.clone()).unwrap();
        let b = Port::new(right, options).unwrap();
        a.start();
        b.start();
        opened(&a).await;
        opened(&b).await;

        let (sender, mut inbox) = mpsc::unbounded_channel();
        b.add_event_listener(MESSAGE_TYPE, ListenerOptions::default(), move |event| {
            let _ = sender.send(event.data().clone());
        })
        .unwrap();
        a.post_message(json!({"over": "text"})).unwrap();
        let received = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(received, json!({"over": "text"}));

        b.close();
        closed(&a).await;
    }

    #[tokio::test]
    async fn no_negotiation_close_stays_local() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::None, false)).unwrap();
        b.start();
        a.close();
        sleep(Duration::from_millis(30)).await;
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn server_closes_after_every_client_leaves() {
        let bus = BroadcastBus::new("clients", 256);
        let server_options = PortOptions::new(HandshakeLevel::Full, true).role(Role::Server);
        let client_options = PortOptions::new(HandshakeLevel::Full, false).role(Role::Client);
        let server = Port::new(bus.join(), server_options).unwrap();
        let first = Port::new(bus.join(), client_options.clone()).unwrap();
        let second = Port::new(bus.join(), client_options).unwrap();

        server.start();
        first.start();
        second.start();
        for port in [&server, &first, &second] {
            opened(port).await;
        }

        timeout(WAIT, async {
            while server.clients().len() < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server did not register both clients");
        let mut clients = server.clients();
        clients.sort();
        let mut expected = vec![
            first.client_id().unwrap().to_owned(),
            second.client_id().unwrap().to_owned(),
        ];
        expected.sort();
        assert_eq!(clients, expected);

        first.close();
        sleep(Duration::from_millis(30)).await;
        assert!(!server.is_closed());
        assert!(!second.is_closed());

        second.close();
        closed(&server).await;
        assert!(server.clients().is_empty());
    }

    #[tokio::test]
    async fn clients_close_when_the_server_leaves() {
        let bus = BroadcastBus::new("server-leaves", 256);
        let server =
            Port::new(bus.join(), PortOptions::new(HandshakeLevel::Full, false).role(Role::Server))
                .unwrap();
        let client =
            Port::new(bus.join(), PortOptions::new(HandshakeLevel::Full, false).role(Role::Client))
                .unwrap();
        server.start();
        client.start();
        opened(&server).await;
        opened(&client).await;
        server.close();
        closed(&client).await;
    }
}
