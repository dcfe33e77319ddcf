//! Forwarding registrations: re-sending dispatched envelopes from one port
//! through another.

use crate::dispose::Disposer;
use crate::event::MessageEvent;
use crate::port::{Port, SendOptions, WeakPort};
use portmesh_protocol::{
    CLOSE_EVENT, ConfigurationError, PortResult, namespaced, strip_namespace, validate_namespace,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Rewrites a payload on its way from `source` to `target`.
pub type Resolver = Arc<dyn Fn(Value, &Port, &Port) -> Value + Send + Sync>;

type Predicate = Arc<dyn Fn(&str, &Port, &Port) -> bool + Send + Sync>;

/// Which event types a registration accepts, matched after the inbound
/// namespace is stripped.
#[derive(Clone)]
pub enum EventFilter {
    Any,
    Types(BTreeSet<String>),
    Predicate(Predicate),
}

impl EventFilter {
    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Types(types.into_iter().map(Into::into).collect())
    }

    pub fn predicate(
        predicate: impl Fn(&str, &Port, &Port) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Types(types) if types.is_empty() || types.iter().any(String::is_empty) => {
                Err(ConfigurationError::EmptyFilter)
            }
            _ => Ok(()),
        }
    }

    fn accepts(&self, event_type: &str, source: &Port, target: &Port) -> bool {
        match self {
            Self::Any => true,
            Self::Types(types) => types.contains(event_type),
            Self::Predicate(predicate) => predicate(event_type, source, target),
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Types(types) => f.debug_tuple("Types").field(types).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ForwardOptions {
    pub resolver: Option<Resolver>,
    /// Also forward from the target back to the source, namespaces swapped.
    pub bidirectional: bool,
    /// Only forward types prefixed `ns:`, with the prefix stripped.
    pub inbound_namespace: Option<String>,
    /// Prefix forwarded types with `ns:`.
    pub outbound_namespace: Option<String>,
}

impl ForwardOptions {
    pub fn bidirectional() -> Self {
        Self {
            bidirectional: true,
            ..Self::default()
        }
    }

    pub fn inbound(mut self, namespace: impl Into<String>) -> Self {
        self.inbound_namespace = Some(namespace.into());
        self
    }

    pub fn outbound(mut self, namespace: impl Into<String>) -> Self {
        self.outbound_namespace = Some(namespace.into());
        self
    }

    pub fn resolver(
        mut self,
        resolver: impl Fn(Value, &Port, &Port) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }
}

impl fmt::Debug for ForwardOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardOptions")
            .field("resolver", &self.resolver.is_some())
            .field("bidirectional", &self.bidirectional)
            .field("inbound_namespace", &self.inbound_namespace)
            .field("outbound_namespace", &self.outbound_namespace)
            .finish()
    }
}

pub(crate) struct ForwardingRegistration {
    id: u64,
    filter: EventFilter,
    target: WeakPort,
    inbound: Option<String>,
    outbound: Option<String>,
    resolver: Option<Resolver>,
    /// Set on the mirror half of a bidirectional pair.
    skip_close: bool,
}

fn check_namespace(namespace: Option<String>) -> Result<Option<String>, ConfigurationError> {
    namespace.map(validate_namespace).transpose()
}

impl Port {
    /// Forward every dispatched envelope accepted by `filter` to `target`.
    pub fn forward_port(
        &self,
        filter: EventFilter,
        target: &Port,
        options: ForwardOptions,
    ) -> PortResult<Disposer> {
        filter.validate()?;
        let inbound = check_namespace(options.inbound_namespace)?;
        let outbound = check_namespace(options.outbound_namespace)?;

        let mut disposers = vec![self.register_forward(ForwardingRegistration {
            id: 0,
            filter: filter.clone(),
            target: target.downgrade(),
            inbound: inbound.clone(),
            outbound: outbound.clone(),
            resolver: options.resolver.clone(),
            skip_close: false,
        })];
        if options.bidirectional {
            disposers.push(target.register_forward(ForwardingRegistration {
                id: 0,
                filter,
                target: self.downgrade(),
                inbound: outbound,
                outbound: inbound,
                resolver: options.resolver,
                skip_close: true,
            }));
        }
        debug!(
            source = %self.id(),
            target = %target.id(),
            bidirectional = options.bidirectional,
            "forwarding registered"
        );
        Ok(Disposer::new(move || {
            for disposer in disposers {
                disposer.dispose();
            }
        }))
    }

    fn register_forward(&self, mut registration: ForwardingRegistration) -> Disposer {
        self.inner.readiness.receiving.fire();
        let id = {
            let mut state = self.inner.state.lock();
            state.next_forward += 1;
            registration.id = state.next_forward;
            state.forwards.push(Arc::new(registration));
            state.next_forward
        };
        let source = self.downgrade();
        Disposer::new(move || {
            if let Some(source) = source.upgrade() {
                source
                    .inner
                    .state
                    .lock()
                    .forwards
                    .retain(|registration| registration.id != id);
            }
        })
    }

    /// Deliver `event` to each forwarding target at most once.
    pub(crate) fn run_forwards(&self, event: &MessageEvent) {
        let registrations = self.inner.state.lock().forwards.clone();
        if registrations.is_empty() {
            return;
        }
        let mut delivered = HashSet::new();
        for registration in registrations {
            let Some(target) = registration.target.upgrade() else {
                continue;
            };
            if delivered.contains(target.id()) {
                continue;
            }
            let local_type = match &registration.inbound {
                Some(namespace) => match strip_namespace(namespace, event.event_type()) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => event.event_type(),
            };
            if registration.skip_close && local_type == CLOSE_EVENT {
                continue;
            }
            if !registration.filter.accepts(local_type, self, &target) {
                continue;
            }
            delivered.insert(target.id().clone());

            let payload = match &registration.resolver {
                Some(resolver) => resolver(event.data().clone(), self, &target),
                None => event.data().clone(),
            };
            let options = SendOptions {
                event_type: Some(namespaced(registration.outbound.as_deref(), local_type)),
                event_id: Some(event.event_id().clone()),
                bubbles: event.bubbles(),
                forwarded: true,
                live: event.envelope().live,
                honour_done: event.envelope().honour_done,
                relayed_from: Some(self.id().clone()),
                transfer: event.ports().to_vec(),
            };
            if let Err(error) = target.send(payload, options) {
                debug!(source = %self.id(), target = %target.id(), %error, "forward dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ListenerOptions;
    use portmesh_protocol::{HandshakeLevel, MESSAGE_TYPE, PortError, PortOptions};
    use serde_json::json;
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

    #[tokio::test]
    async fn overlapping_registrations_deliver_once() {
        let (upstream, source) = Port::pair(plain()).unwrap();
        let (target, downstream) = Port::pair(plain()).unwrap();
        source
            .forward_port(EventFilter::Any, &target, ForwardOptions::default())
            .unwrap();
        source
            .forward_port(
                EventFilter::types([MESSAGE_TYPE]),
                &target,
                ForwardOptions::default(),
            )
            .unwrap();
        let mut received = inbox(&downstream, MESSAGE_TYPE);

        upstream.post_message(json!("hello")).unwrap();
        let event = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(event.data(), &json!("hello"));
        assert!(event.is_forwarded());
        sleep(Duration::from_millis(30)).await;
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn namespaces_and_resolver_rewrite_the_hop() {
        let (upstream, source) = Port::pair(plain()).unwrap();
        let (target, downstream) = Port::pair(plain()).unwrap();
        let options = ForwardOptions::default()
            .inbound("in")
            .outbound("out")
            .resolver(|payload, _, _| json!({ "wrapped": payload }));
        source
            .forward_port(EventFilter::Any, &target, options)
            .unwrap();
        let mut received = inbox(&downstream, "out:ping");
        let mut leaked = inbox(&downstream, "out:other");

        upstream
            .send(json!(1), SendOptions::typed("other"))
            .unwrap();
        upstream.send(json!(2), SendOptions::typed("in:ping")).unwrap();
        let event = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(event.data(), &json!({"wrapped": 2}));
        assert!(leaked.try_recv().is_err());
    }

    #[tokio::test]
    async fn mirror_carries_replies_but_not_close() {
        let (upstream, source) = Port::pair(plain()).unwrap();
        let (target, downstream) = Port::pair(plain()).unwrap();
        source
            .forward_port(EventFilter::Any, &target, ForwardOptions::bidirectional())
            .unwrap();
        let mut replies = inbox(&upstream, "reply");
        let mut echoed = inbox(&upstream, CLOSE_EVENT);
        let mut forwarded = inbox(&downstream, CLOSE_EVENT);

        downstream
            .send(json!("back"), SendOptions::typed(CLOSE_EVENT))
            .unwrap();
        downstream
            .send(json!("back"), SendOptions::typed("reply"))
            .unwrap();
        let event = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert!(event.is_forwarded());
        assert!(echoed.try_recv().is_err());

        upstream
            .send(json!("out"), SendOptions::typed(CLOSE_EVENT))
            .unwrap();
        let event = timeout(WAIT, forwarded.recv()).await.unwrap().unwrap();
        assert_eq!(event.data(), &json!("out"));
        sleep(Duration::from_millis(30)).await;
        assert!(echoed.try_recv().is_err());
    }

    #[tokio::test]
    async fn mirror_skips_close_after_stripping_its_namespace() {
        let (upstream, source) = Port::pair(plain()).unwrap();
        let (target, downstream) = Port::pair(plain()).unwrap();
        let options = ForwardOptions::bidirectional().inbound("in").outbound("out");
        source
            .forward_port(EventFilter::Any, &target, options)
            .unwrap();
        let mut pings = inbox(&upstream, "in:ping");
        let mut closes = inbox(&upstream, "in:close");

        downstream
            .send(json!(1), SendOptions::typed("out:close"))
            .unwrap();
        downstream
            .send(json!(2), SendOptions::typed("out:ping"))
            .unwrap();
        let event = timeout(WAIT, pings.recv()).await.unwrap().unwrap();
        assert_eq!(event.data(), &json!(2));
        sleep(Duration::from_millis(30)).await;
        assert!(closes.try_recv().is_err());
    }

    #[tokio::test]
    async fn disposed_forward_stops_delivery() {
        let (upstream, source) = Port::pair(plain()).unwrap();
        let (target, downstream) = Port::pair(plain()).unwrap();
        let disposer = source
            .forward_port(EventFilter::Any, &target, ForwardOptions::default())
            .unwrap();
        let mut received = inbox(&downstream, MESSAGE_TYPE);
        let mut seen = inbox(&source, MESSAGE_TYPE);

        disposer.dispose();
        upstream.post_message(json!(1)).unwrap();
        timeout(WAIT, seen.recv()).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn predicate_sees_source_and_target() {
        let (upstream, source) = Port::pair(plain()).unwrap();
        let (target, downstream) = Port::pair(plain()).unwrap();
        let target_id = target.id().clone();
        let filter = EventFilter::predicate(move |event_type, _, to| {
            event_type.starts_with("keep") && to.id() == &target_id
        });
        source
            .forward_port(filter, &target, ForwardOptions::default())
            .unwrap();
        let mut kept = inbox(&downstream, "keep-me");
        upstream
            .send(json!("x"), SendOptions::typed("drop-me"))
            .unwrap();
        upstream
            .send(json!("y"), SendOptions::typed("keep-me"))
            .unwrap();
        let event = timeout(WAIT, kept.recv()).await.unwrap().unwrap();
        assert_eq!(event.data(), &json!("y"));
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let (a, b) = Port::pair(plain()).unwrap();
        let empty = a.forward_port(
            EventFilter::types(Vec::<String>::new()),
            &b,
            ForwardOptions::default(),
        );
        assert!(matches!(
            empty,
            Err(PortError::Configuration(ConfigurationError::EmptyFilter))
        ));
        let blank = a.forward_port(EventFilter::Any, &b, ForwardOptions::default().inbound(""));
        assert!(matches!(
            blank,
            Err(PortError::Configuration(ConfigurationError::EmptyNamespace))
        ));
    }
}
