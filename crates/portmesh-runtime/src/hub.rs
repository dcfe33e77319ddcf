//! Star topology: one port fanning out to, and aggregating from, a set of
//! member ports.

use crate::dispose::Disposer;
use crate::port::{Port, WeakPort};
use portmesh_protocol::{HandshakeLevel, PortOptions, PortResult, TopologyError};
use std::ops::Deref;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct MembershipOptions {
    /// Record the hub as the member's parent so its events re-dispatch on
    /// the hub. A port can have one bubbling parent at a time.
    pub bubbling: bool,
}

impl Default for MembershipOptions {
    fn default() -> Self {
        Self { bubbling: true }
    }
}

/// A port whose sends fan out to every member except the relay origin.
///
/// With [`HandshakeLevel::None`] and `auto_close`, removing the last member
/// closes the hub. Negotiated hubs open on start and close only once every
/// member has closed.
#[derive(Debug, Clone)]
pub struct Hub {
    port: Port,
}

impl Hub {
    pub fn new(options: PortOptions) -> PortResult<Self> {
        Ok(Self {
            port: Port::hub(options)?,
        })
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn members(&self) -> Vec<Port> {
        self.port.inner.state.lock().members.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.port.inner.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_port(&self, predicate: impl Fn(&Port) -> bool) -> Option<Port> {
        self.members().into_iter().find(|member| predicate(member))
    }

    /// Attach `member`. The returned disposer detaches it; it also runs when
    /// the member closes. Adding a current member again is a no-op.
    pub fn add_port(&self, member: &Port, options: MembershipOptions) -> PortResult<Disposer> {
        match self.attach(member, options.bubbling, None)? {
            Some(detach) => {
                member.inner.readiness.receiving.fire();
                Ok(detach)
            }
            None => Ok(Disposer::noop()),
        }
    }

    /// `None` when `member` is already attached. `prelude` runs first on
    /// detach. The caller starts the member's receive loop.
    #[instrument(skip_all, fields(hub = %self.port.id(), member = %member.id()))]
    pub(crate) fn attach(
        &self,
        member: &Port,
        bubbling: bool,
        prelude: Option<Disposer>,
    ) -> Result<Option<Disposer>, TopologyError> {
        let hub = &self.port;
        if hub.is_closed() {
            return Err(TopologyError::HubClosed {
                hub: hub.id().clone(),
            });
        }
        if member == hub {
            return Err(TopologyError::SelfAttachment(hub.id().clone()));
        }
        if member.is_closed() {
            return Err(TopologyError::MemberClosed {
                port: member.id().clone(),
            });
        }
        {
            let mut state = hub.inner.state.lock();
            if state.members.contains_key(member.id()) {
                debug!("already a member");
                return Ok(None);
            }
            if bubbling {
                let mut member_state = member.inner.state.lock();
                let parented = member_state
                    .parent
                    .as_ref()
                    .and_then(WeakPort::upgrade)
                    .is_some_and(|parent| !parent.is_closed());
                if parented {
                    return Err(TopologyError::AlreadyParented {
                        port: member.id().clone(),
                    });
                }
                member_state.parent = Some(hub.downgrade());
            }
            state.members.insert(member.id().clone(), member.clone());
        }

        let weak_hub = hub.downgrade();
        let weak_member = member.downgrade();
        let member_id = member.id().clone();
        let cleanup = Disposer::new(move || {
            if let Some(prelude) = prelude {
                prelude.dispose();
            }
            let Some(hub) = weak_hub.upgrade() else {
                return;
            };
            let remaining = {
                let mut state = hub.inner.state.lock();
                state.members.shift_remove(&member_id);
                state.members.len()
            };
            if let Some(member) = weak_member.upgrade() {
                let mut member_state = member.inner.state.lock();
                if member_state
                    .parent
                    .as_ref()
                    .is_some_and(|parent| parent.is(&hub))
                {
                    member_state.parent = None;
                }
            }
            debug!(hub = %hub.id(), member = %member_id, remaining, "member detached");
            let options = hub.options();
            if remaining == 0 && options.auto_close && options.handshake == HandshakeLevel::None {
                info!(hub = %hub.id(), "last member left, auto-closing hub");
                hub.close();
            }
        });

        let weak_hub = hub.downgrade();
        member.inner.readiness.open.on_fire(move || {
            if let Some(hub) = weak_hub.upgrade() {
                hub.start();
            }
        });
        let on_close = cleanup.clone();
        member
            .inner
            .readiness
            .closed
            .on_fire(move || on_close.dispose());
        debug!("member attached");
        Ok(Some(cleanup))
    }
}

impl Deref for Hub {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageEvent;
    use crate::port::{ListenerOptions, SendOptions};
    use crate::ReadyStateQuery;
    use portmesh_protocol::{MESSAGE_TYPE, PortError};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn plain() -> PortOptions {
        PortOptions::new(HandshakeLevel::None, false)
    }

    fn inbox(port: &Port) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        port.add_event_listener(MESSAGE_TYPE, ListenerOptions::default(), move |event| {
            let _ = sender.send(event.clone());
        })
        .unwrap();
        receiver
    }

    #[tokio::test]
    async fn sends_fan_out_except_to_the_origin() {
        let hub = Hub::new(plain()).unwrap();
        let (a_near, a_far) = Port::pair(plain()).unwrap();
        let (b_near, b_far) = Port::pair(plain()).unwrap();
        hub.add_port(&a_near, MembershipOptions::default()).unwrap();
        hub.add_port(&b_near, MembershipOptions::default()).unwrap();
        let mut a_inbox = inbox(&a_far);
        let mut b_inbox = inbox(&b_far);

        hub.post_message(json!("everyone")).unwrap();
        assert_eq!(timeout(WAIT, a_inbox.recv()).await.unwrap().unwrap().data(), &json!("everyone"));
        assert_eq!(timeout(WAIT, b_inbox.recv()).await.unwrap().unwrap().data(), &json!("everyone"));

        let options = SendOptions {
            relayed_from: Some(a_near.id().clone()),
            ..SendOptions::default()
        };
        hub.send(json!("not a"), options).unwrap();
        assert_eq!(timeout(WAIT, b_inbox.recv()).await.unwrap().unwrap().data(), &json!("not a"));
        sleep(Duration::from_millis(30)).await;
        assert!(a_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn member_events_bubble_to_the_hub() {
        let hub = Hub::new(plain()).unwrap();
        let (near, far) = Port::pair(plain()).unwrap();
        hub.add_port(&near, MembershipOptions::default()).unwrap();
        let mut aggregated = inbox(hub.port());
        far.post_message(json!("up")).unwrap();
        let event = timeout(WAIT, aggregated.recv()).await.unwrap().unwrap();
        assert_eq!(event.data(), &json!("up"));
        assert_eq!(event.origin(), near.id());
        assert_eq!(near.parent().as_ref(), Some(hub.port()));
        assert!(hub.find_port(|port| port.id() == near.id()).is_some());
    }

    #[tokio::test]
    async fn topology_violations_are_rejected() {
        let first = Hub::new(plain()).unwrap();
        let second = Hub::new(plain()).unwrap();
        let (near, _far) = Port::pair(plain()).unwrap();
        first.add_port(&near, MembershipOptions::default()).unwrap();

        let again = first.add_port(&near, MembershipOptions::default()).unwrap();
        assert!(again.is_disposed());
        assert_eq!(first.len(), 1);

        let err = second
            .add_port(&near, MembershipOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PortError::Topology(TopologyError::AlreadyParented { .. })
        ));
        second
            .add_port(&near, MembershipOptions { bubbling: false })
            .unwrap();

        let err = first
            .add_port(first.port(), MembershipOptions::default())
            .unwrap_err();
        assert!(matches!(err, PortError::Topology(TopologyError::SelfAttachment(_))));

        first.close();
        let (other, _) = Port::pair(plain()).unwrap();
        let err = first
            .add_port(&other, MembershipOptions::default())
            .unwrap_err();
        assert!(matches!(err, PortError::Topology(TopologyError::HubClosed { .. })));
    }

    #[tokio::test]
    async fn closed_port_cannot_join() {
        let hub = Hub::new(PortOptions::new(HandshakeLevel::None, true)).unwrap();
        let (gone, _far) = Port::pair(plain()).unwrap();
        gone.close();

        let err = hub
            .add_port(&gone, MembershipOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PortError::Topology(TopologyError::MemberClosed { .. })
        ));
        assert!(hub.is_empty());
        assert!(gone.parent().is_none());
        sleep(Duration::from_millis(20)).await;
        assert!(!hub.is_closed());
    }

    #[tokio::test]
    async fn unnegotiated_hub_auto_closes_when_emptied() {
        let hub = Hub::new(PortOptions::new(HandshakeLevel::None, true)).unwrap();
        let (a, _a_far) = Port::pair(plain()).unwrap();
        let (b, _b_far) = Port::pair(plain()).unwrap();
        let detach_a = hub.add_port(&a, MembershipOptions::default()).unwrap();
        hub.add_port(&b, MembershipOptions::default()).unwrap();

        detach_a.dispose();
        assert!(!hub.is_closed());
        assert!(a.parent().is_none());
        b.close();
        timeout(WAIT, hub.ready_state_change(ReadyStateQuery::Closed))
            .await
            .unwrap();
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn negotiated_hub_waits_for_every_member() {
        let hub = Hub::new(PortOptions::new(HandshakeLevel::Full, true)).unwrap();
        let negotiated = PortOptions::new(HandshakeLevel::Full, false);
        let (a, a_far) = Port::pair(negotiated.clone()).unwrap();
        let (b, b_far) = Port::pair(negotiated).unwrap();
        hub.add_port(&a, MembershipOptions::default()).unwrap();
        hub.add_port(&b, MembershipOptions::default()).unwrap();
        for port in [&a, &b, &a_far, &b_far] {
            port.start();
        }
        timeout(WAIT, hub.ready_state_change(ReadyStateQuery::Open))
            .await
            .unwrap();

        // Losing a member does not close a negotiated hub.
        a.close();
        assert!(!hub.is_closed());

        let members_closed_first = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&members_closed_first);
        let watched = b.clone();
        hub.add_event_listener("close", ListenerOptions::default(), move |_| {
            flag.store(watched.is_closed(), Ordering::SeqCst);
        })
        .unwrap();
        hub.close();
        timeout(WAIT, hub.ready_state_change(ReadyStateQuery::Closed))
            .await
            .unwrap();
        assert!(members_closed_first.load(Ordering::SeqCst));
        timeout(WAIT, b_far.ready_state_change(ReadyStateQuery::Closed))
            .await
            .unwrap();
    }
}
