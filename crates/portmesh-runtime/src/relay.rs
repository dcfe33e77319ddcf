//! Namespace bridge built on [`Hub`].
//!
//! Each member forwards its namespaced traffic back into the relay, which
//! fans it out to every other member. Membership changes are announced as
//! ordinary messages on [`RelayNamespace::announcement_type`]:
//! `{"event": "joins" | "leaves", "member": <port id>}`.

use crate::dispose::Disposer;
use crate::forward::{EventFilter, ForwardOptions, Resolver};
use crate::hub::Hub;
use crate::port::{Port, SendOptions};
use parking_lot::Mutex;
use portmesh_protocol::{PortOptions, PortResult, RelayNamespace, validate_namespace};
use serde_json::json;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct RelayMemberOptions {
    pub bubbling: bool,
    /// Applied to the member's relayed payloads and to its announcements.
    pub resolver: Option<Resolver>,
}

impl Default for RelayMemberOptions {
    fn default() -> Self {
        Self {
            bubbling: true,
            resolver: None,
        }
    }
}

impl fmt::Debug for RelayMemberOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMemberOptions")
            .field("bubbling", &self.bubbling)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Relay {
    hub: Hub,
    namespace: RelayNamespace,
}

impl Relay {
    pub fn new(namespace: RelayNamespace, options: PortOptions) -> PortResult<Self> {
        let namespace = RelayNamespace {
            inbound: namespace.inbound.map(validate_namespace).transpose()?,
            outbound: namespace.outbound.map(validate_namespace).transpose()?,
        };
        Ok(Self {
            hub: Hub::new(options)?,
            namespace,
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn port(&self) -> &Port {
        self.hub.port()
    }

    pub fn namespace(&self) -> &RelayNamespace {
        &self.namespace
    }

    /// Attach `member`, announce it to the existing members, then start
    /// relaying its traffic. Detaching (or the member closing) announces
    /// `leaves` once and removes the forward.
    #[instrument(skip_all, fields(relay = %self.port().id(), member = %member.id()))]
    pub fn add_port(&self, member: &Port, options: RelayMemberOptions) -> PortResult<Disposer> {
        let slot: Arc<Mutex<Option<Disposer>>> = Arc::default();
        let prelude = {
            let relay = self.port().downgrade();
            let departing = member.downgrade();
            let slot = Arc::clone(&slot);
            let announcement = Announcement {
                event_type: self.namespace.announcement_type(),
                resolver: options.resolver.clone(),
            };
            Disposer::new(move || {
                if let (Some(relay), Some(member)) = (relay.upgrade(), departing.upgrade()) {
                    announcement.send(&relay, &member, "leaves");
                }
                if let Some(forward) = slot.lock().take() {
                    forward.dispose();
                }
            })
        };

        let Some(detach) = self.hub.attach(member, options.bubbling, Some(prelude))? else {
            return Ok(Disposer::noop());
        };
        Announcement {
            event_type: self.namespace.announcement_type(),
            resolver: options.resolver.clone(),
        }
        .send(self.port(), member, "joins");

        let forward_options = ForwardOptions {
            resolver: options.resolver,
            bidirectional: false,
            inbound_namespace: self.namespace.inbound.clone(),
            outbound_namespace: self.namespace.outbound.clone(),
        };
        let forward = match member.forward_port(EventFilter::Any, self.port(), forward_options) {
            Ok(forward) => forward,
            Err(error) => {
                detach.dispose();
                return Err(error);
            }
        };
        if detach.is_disposed() {
            forward.dispose();
        } else {
            *slot.lock() = Some(forward);
        }
        Ok(detach)
    }
}

impl Deref for Relay {
    type Target = Hub;

    fn deref(&self) -> &Hub {
        &self.hub
    }
}

struct Announcement {
    event_type: String,
    resolver: Option<Resolver>,
}

impl Announcement {
    fn send(&self, relay: &Port, member: &Port, event: &str) {
        let payload = json!({ "event": event, "member": member.id() });
        let payload = match &self.resolver {
            Some(resolver) => resolver(payload, member, relay),
            None => payload,
        };
        let options = SendOptions {
            relayed_from: Some(member.id().clone()),
            ..SendOptions::typed(self.event_type.clone())
        };
        match relay.send(payload, options) {
            Ok(_) => debug!(relay = %relay.id(), member = %member.id(), event, "membership announced"),
            Err(error) => debug!(relay = %relay.id(), %error, "announcement dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageEvent;
    use crate::port::ListenerOptions;
    use portmesh_protocol::{ConfigurationError, HandshakeLevel, MESSAGE_TYPE, PortError};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn plain() -> PortOptions {
        PortOptions::new(HandshakeLevel::None, false)
    }

    fn inbox(port: &Port, event_type: &str) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        port.add_event_listener(event_type, ListenerOptions::default(), move |event| {
            let _ = sender.send(event.clone());
        })
        .unwrap();
        receiver
    }

    async fn next(inbox: &mut mpsc::UnboundedReceiver<MessageEvent>) -> Value {
        timeout(WAIT, inbox.recv()).await.unwrap().unwrap().data().clone()
    }

    #[tokio::test]
    async fn join_is_announced_before_member_traffic() {
        let relay = Relay::new(RelayNamespace::none(), plain()).unwrap();
        let (a_near, a_far) = Port::pair(plain()).unwrap();
        let (b_near, b_far) = Port::pair(plain()).unwrap();
        relay.add_port(&a_near, RelayMemberOptions::default()).unwrap();
        let mut seen_by_a = inbox(&a_far, MESSAGE_TYPE);
        let mut seen_by_b = inbox(&b_far, MESSAGE_TYPE);

        relay.add_port(&b_near, RelayMemberOptions::default()).unwrap();
        b_far.post_message(json!("hi from b")).unwrap();

        let member = b_near.id().as_str();
        assert_eq!(next(&mut seen_by_a).await, json!({"event": "joins", "member": member}));
        assert_eq!(next(&mut seen_by_a).await, json!("hi from b"));
        sleep(Duration::from_millis(30)).await;
        assert!(seen_by_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_is_announced_exactly_once() {
        let relay = Relay::new(RelayNamespace::none(), plain()).unwrap();
        let (a_near, a_far) = Port::pair(plain()).unwrap();
        let (b_near, _b_far) = Port::pair(plain()).unwrap();
        relay.add_port(&a_near, RelayMemberOptions::default()).unwrap();
        let detach = relay.add_port(&b_near, RelayMemberOptions::default()).unwrap();
        let mut seen_by_a = inbox(&a_far, MESSAGE_TYPE);
        assert_eq!(next(&mut seen_by_a).await["event"], json!("joins"));

        detach.dispose();
        b_near.close();
        detach.dispose();

        let member = b_near.id().as_str();
        assert_eq!(next(&mut seen_by_a).await, json!({"event": "leaves", "member": member}));
        sleep(Duration::from_millis(30)).await;
        assert!(seen_by_a.try_recv().is_err());
        assert_eq!(relay.len(), 1);
    }

    #[tokio::test]
    async fn namespaced_traffic_is_bridged_through_the_resolver() {
        let namespace = RelayNamespace::shared("net").unwrap();
        let relay = Relay::new(namespace, plain()).unwrap();
        let (a_near, a_far) = Port::pair(plain()).unwrap();
        let (b_near, b_far) = Port::pair(plain()).unwrap();
        let options = RelayMemberOptions {
            resolver: Some(Arc::new(|payload: Value, _: &Port, _: &Port| {
                json!({ "via": "relay", "body": payload })
            })),
            ..RelayMemberOptions::default()
        };
        relay.add_port(&a_near, options.clone()).unwrap();
        let mut seen_by_a = inbox(&a_far, "net:message");
        relay.add_port(&b_near, options).unwrap();

        b_far.send(json!("ignored"), SendOptions::typed("other")).unwrap();
        b_far.send(json!(5), SendOptions::typed("net:message")).unwrap();

        assert_eq!(next(&mut seen_by_a).await["body"]["event"], json!("joins"));
        assert_eq!(next(&mut seen_by_a).await, json!({"via": "relay", "body": 5}));
        assert_eq!(relay.namespace().announcement_type(), "net:message");
    }

    #[tokio::test]
    async fn closed_member_is_refused_without_a_leave() {
        let relay = Relay::new(RelayNamespace::none(), plain()).unwrap();
        let (a_near, a_far) = Port::pair(plain()).unwrap();
        relay.add_port(&a_near, RelayMemberOptions::default()).unwrap();
        let mut seen_by_a = inbox(&a_far, MESSAGE_TYPE);
        let (gone, _gone_far) = Port::pair(plain()).unwrap();
        gone.close();

        let err = relay.add_port(&gone, RelayMemberOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            PortError::Topology(portmesh_protocol::TopologyError::MemberClosed { .. })
        ));
        sleep(Duration::from_millis(30)).await;
        assert!(seen_by_a.try_recv().is_err());
        assert_eq!(relay.len(), 1);
    }

    #[tokio::test]
    async fn empty_namespace_is_rejected() {
        let namespace = RelayNamespace {
            inbound: Some(String::new()),
            outbound: None,
        };
        let err = Relay::new(namespace, plain()).unwrap_err();
        assert!(matches!(
            err,
            PortError::Configuration(ConfigurationError::EmptyNamespace)
        ));
    }
}
