//! Live replication of structured values.
//!
//! A [`LiveValue`] is a shared JSON document whose changes are committed in
//! batches. Publishing one on a port streams each committed batch as an
//! `<event_id>.mutate` envelope; subscribing applies those batches to a
//! mirror, one batch at a time.

use crate::dispose::Disposer;
use crate::latch::CancelSignal;
use crate::port::{ListenerOptions, Port, SendOptions};
use parking_lot::Mutex;
use portmesh_protocol::{
    ArrayMethod, ConfigurationError, EventId, MutationOp, MutationRecord, PortResult,
    ProtocolViolation, apply_batch, decode_batch,
};
use serde_json::Value;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

type Observer = Arc<dyn Fn(&[MutationRecord]) -> ControlFlow<()> + Send + Sync>;

#[derive(Clone)]
pub struct LiveValue {
    inner: Arc<LiveInner>,
}

struct LiveInner {
    value: Mutex<Value>,
    /// Serializes commit + notify so observers see batches in commit order.
    commit: Mutex<()>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
}

/// Records collected by [`LiveValue::transaction`].
#[derive(Debug, Default)]
pub struct Transaction {
    records: Vec<MutationRecord>,
}

impl Transaction {
    pub fn set(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.push(MutationOp::Set {
            path: path.into(),
            value,
        })
    }

    pub fn remove(&mut self, path: impl Into<String>) -> &mut Self {
        self.push(MutationOp::Delete { path: path.into() })
    }

    pub fn call(
        &mut self,
        path: impl Into<String>,
        method: ArrayMethod,
        arguments: Vec<Value>,
    ) -> &mut Self {
        self.push(MutationOp::Call {
            path: path.into(),
            method,
            arguments,
        })
    }

    /// Flag the batch as the last one of the stream.
    pub fn mark_done(&mut self) -> &mut Self {
        if let Some(last) = self.records.last_mut() {
            last.done = true;
        }
        self
    }

    fn push(&mut self, op: MutationOp) -> &mut Self {
        self.records.push(MutationRecord::new(op));
        self
    }
}

impl LiveValue {
    pub fn new(value: Value) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                value: Mutex::new(value),
                commit: Mutex::new(()),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> Value {
        self.inner.value.lock().clone()
    }

    /// Value at a JSON pointer.
    pub fn get(&self, pointer: &str) -> Option<Value> {
        self.inner.value.lock().pointer(pointer).cloned()
    }

    pub fn is_structured(&self) -> bool {
        let value = self.inner.value.lock();
        value.is_object() || value.is_array()
    }

    pub fn set(&self, path: &str, value: Value) -> Result<(), ProtocolViolation> {
        self.transaction(|tx| {
            tx.set(path, value);
        })
    }

    pub fn remove(&self, path: &str) -> Result<(), ProtocolViolation> {
        self.transaction(|tx| {
            tx.remove(path);
        })
    }

    pub fn call(
        &self,
        path: &str,
        method: ArrayMethod,
        arguments: Vec<Value>,
    ) -> Result<(), ProtocolViolation> {
        self.transaction(|tx| {
            tx.call(path, method, arguments);
        })
    }

    /// Commit several changes as one batch. Observers must not mutate the
    /// value they observe.
    pub fn transaction(&self, build: impl FnOnce(&mut Transaction)) -> Result<(), ProtocolViolation> {
        let mut tx = Transaction::default();
        build(&mut tx);
        self.apply(&tx.records)
    }

    /// Apply a batch atomically: either every record lands or none does.
    pub fn apply(&self, batch: &[MutationRecord]) -> Result<(), ProtocolViolation> {
        if batch.is_empty() {
            return Ok(());
        }
        let _commit = self.inner.commit.lock();
        {
            let mut value = self.inner.value.lock();
            let next = apply_batch(&value, batch)?;
            *value = next;
        }
        self.notify(batch);
        Ok(())
    }

    fn notify(&self, batch: &[MutationRecord]) {
        let observers: Vec<(u64, Observer)> = self.inner.observers.lock().clone();
        let finished: Vec<u64> = observers
            .into_iter()
            .filter_map(|(id, observer)| observer(batch).is_break().then_some(id))
            .collect();
        if !finished.is_empty() {
            self.inner
                .observers
                .lock()
                .retain(|(id, _)| !finished.contains(id));
        }
    }

    /// Watch committed batches until the observer breaks or the returned
    /// disposer runs.
    pub fn observe(
        &self,
        observer: impl Fn(&[MutationRecord]) -> ControlFlow<()> + Send + Sync + 'static,
    ) -> Disposer {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((id, Arc::new(observer)));
        let weak: Weak<LiveInner> = Arc::downgrade(&self.inner);
        Disposer::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.lock().retain(|(observer, _)| *observer != id);
            }
        })
    }
}

impl fmt::Debug for LiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveValue").field(&self.snapshot()).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiveOptions {
    /// Stop after a batch flagged done.
    pub honour_done: bool,
    pub signal: Option<CancelSignal>,
}

impl Port {
    /// Stream every committed batch of `value` as `<event_id>.mutate`.
    pub fn publish(
        &self,
        value: &LiveValue,
        event_id: &EventId,
        options: LiveOptions,
    ) -> PortResult<Disposer> {
        if !value.is_structured() {
            return Err(ConfigurationError::NotStructured.into());
        }
        let port = self.downgrade();
        let mutate_type = event_id.mutate_type();
        let honour_done = options.honour_done;
        let observation = value.observe(move |batch| {
            let Some(port) = port.upgrade() else {
                return ControlFlow::Break(());
            };
            let payload = match serde_json::to_value(batch) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(port_id = %port.id(), %error, "cannot encode mutation batch");
                    return ControlFlow::Continue(());
                }
            };
            if let Err(error) = port.send(payload, SendOptions::typed(mutate_type.clone())) {
                debug!(port_id = %port.id(), %error, "publication ended");
                return ControlFlow::Break(());
            }
            if honour_done && batch.iter().any(|record| record.done) {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        if let Some(signal) = options.signal {
            let cancelled = observation.clone();
            signal.on_cancel(move || cancelled.dispose());
        }
        self.defer(observation.clone());
        Ok(observation)
    }

    /// Apply incoming `<event_id>.mutate` batches to `value`.
    pub fn subscribe(&self, value: &LiveValue, event_id: &EventId, options: LiveOptions) -> Disposer {
        let signal = CancelSignal::new();
        if let Some(outer) = options.signal {
            let inner = signal.clone();
            outer.on_cancel(move || inner.cancel());
        }
        let mirror = value.clone();
        let stop = signal.clone();
        let port_id = self.id().clone();
        let honour_done = options.honour_done;
        self.listen(
            &event_id.mutate_type(),
            ListenerOptions::default().with_signal(signal.clone()),
            move |event| {
                let batch = match decode_batch(event.data()) {
                    Ok(batch) => batch,
                    Err(violation) => {
                        warn!(port_id = %port_id, %violation, "dropping mutation batch");
                        return;
                    }
                };
                if let Err(violation) = mirror.apply(&batch) {
                    warn!(port_id = %port_id, %violation, "dropping mutation batch");
                }
                if honour_done && batch.iter().any(|record| record.done) {
                    stop.cancel();
                }
            },
        );
        let disposer = Disposer::new(move || signal.cancel());
        self.defer(disposer.clone());
        disposer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::{EventFilter, ForwardOptions};
    use portmesh_protocol::{HandshakeLevel, MESSAGE_TYPE, PortError, PortOptions};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn batches(value: &LiveValue) -> mpsc::UnboundedReceiver<Vec<MutationRecord>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _observation = value.observe(move |batch| {
            let _ = sender.send(batch.to_vec());
            ControlFlow::Continue(())
        });
        receiver
    }

    fn live_mirror(port: &Port) -> oneshot::Receiver<LiveValue> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        port.add_event_listener(MESSAGE_TYPE, ListenerOptions::once(), move |event| {
            if let (Some(sender), Some(live)) = (sender.lock().take(), event.live()) {
                let _ = sender.send(live.clone());
            }
        })
        .unwrap();
        receiver
    }

    #[test]
    fn transaction_is_atomic() {
        let value = LiveValue::new(json!({"a": 1}));
        let failed = value.transaction(|tx| {
            tx.set("/a", json!(2)).set("/missing/deep", json!(0));
        });
        assert!(failed.is_err());
        assert_eq!(value.snapshot(), json!({"a": 1}));

        value
            .transaction(|tx| {
                tx.set("/a", json!(2)).set("/b", json!(3));
            })
            .unwrap();
        assert_eq!(value.get("/b"), Some(json!(3)));
    }

    #[tokio::test]
    async fn replicated_value_converges_in_whole_batches() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::None, false)).unwrap();
        let mirror_rx = live_mirror(&b);
        let source = LiveValue::new(json!({"a": 1}));
        a.send_live(&source, SendOptions::default()).unwrap();

        let mirror = timeout(WAIT, mirror_rx).await.unwrap().unwrap();
        assert_eq!(mirror.snapshot(), json!({"a": 1}));
        let mut applied = batches(&mirror);

        source
            .transaction(|tx| {
                tx.set("/a", json!(2)).set("/b", json!(3));
            })
            .unwrap();
        let batch = timeout(WAIT, applied.recv()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(mirror.snapshot(), json!({"a": 2, "b": 3}));

        source
            .call("/list", ArrayMethod::Push, vec![json!(1)])
            .unwrap_err();
        source.set("/list", json!([])).unwrap();
        source
            .call("/list", ArrayMethod::Push, vec![json!("x"), json!("y")])
            .unwrap();
        source.call("/list", ArrayMethod::Shift, vec![]).unwrap();
        for _ in 0..3 {
            timeout(WAIT, applied.recv()).await.unwrap();
        }
        assert_eq!(mirror.snapshot(), json!({"a": 2, "b": 3, "list": ["y"]}));
    }

    #[tokio::test]
    async fn done_flag_ends_the_stream_when_honoured() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::None, false)).unwrap();
        let mirror_rx = live_mirror(&b);
        let source = LiveValue::new(json!({"n": 0}));
        let options = SendOptions {
            honour_done: true,
            ..SendOptions::default()
        };
        a.send_live(&source, options).unwrap();
        let mirror = timeout(WAIT, mirror_rx).await.unwrap().unwrap();
        let mut applied = batches(&mirror);

        source
            .transaction(|tx| {
                tx.set("/n", json!(1)).mark_done();
            })
            .unwrap();
        timeout(WAIT, applied.recv()).await.unwrap();
        source.set("/n", json!(2)).unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(mirror.snapshot(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn malformed_batches_are_dropped() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::None, false)).unwrap();
        let mirror = LiveValue::new(json!({"a": 1}));
        let event_id = EventId::from_string("doc-1");
        b.subscribe(&mirror, &event_id, LiveOptions::default());
        b.start();
        let mut applied = batches(&mirror);

        let mutate = SendOptions::typed(event_id.mutate_type());
        a.send(json!({"not": "a batch"}), mutate.clone()).unwrap();
        let partly_invalid = json!([
            {"op": "set", "path": "/a", "value": 5},
            {"op": "set", "path": "bad", "value": 0}
        ]);
        a.send(partly_invalid, mutate.clone()).unwrap();
        a.send(json!([{"op": "set", "path": "/a", "value": 9}]), mutate)
            .unwrap();
        let batch = timeout(WAIT, applied.recv()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(mirror.snapshot(), json!({"a": 9}));
    }

    #[tokio::test]
    async fn oversized_sparse_write_leaves_the_port_listening() {
        let (a, b) = Port::pair(PortOptions::new(HandshakeLevel::None, false)).unwrap();
        let mirror = LiveValue::new(json!({"list": []}));
        let event_id = EventId::from_string("doc-2");
        b.subscribe(&mirror, &event_id, LiveOptions::default());
        let (sender, mut inbox) = mpsc::unbounded_channel();
        b.add_event_listener(MESSAGE_TYPE, ListenerOptions::default(), move |event| {
            let _ = sender.send(event.data().clone());
        })
        .unwrap();

        let hostile = json!([{"op": "set", "path": format!("/list/{}", u64::MAX), "value": 1}]);
        a.send(hostile, SendOptions::typed(event_id.mutate_type()))
            .unwrap();
        a.post_message(json!("after")).unwrap();

        let delivered = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(delivered, json!("after"));
        assert_eq!(mirror.snapshot(), json!({"list": []}));
    }

    #[tokio::test]
    async fn forwarded_live_value_converges_without_republishing() {
        let plain = PortOptions::new(HandshakeLevel::None, false);
        let (origin, relay_in) = Port::pair(plain.clone()).unwrap();
        let (relay_out, far) = Port::pair(plain).unwrap();
        relay_in
            .forward_port(EventFilter::Any, &relay_out, ForwardOptions::default())
            .unwrap();
        let (sender, mut arrivals) = mpsc::unbounded_channel();
        far.add_event_listener(MESSAGE_TYPE, ListenerOptions::once(), move |event| {
            let _ = sender.send((event.is_forwarded(), event.live().cloned()));
        })
        .unwrap();

        let source = LiveValue::new(json!({"items": []}));
        origin.send_live(&source, SendOptions::default()).unwrap();
        let (forwarded, mirror) = timeout(WAIT, arrivals.recv()).await.unwrap().unwrap();
        assert!(forwarded);
        let mirror = mirror.unwrap();
        let mut applied = batches(&mirror);

        source
            .call("/items", ArrayMethod::Push, vec![json!(1), json!(2)])
            .unwrap();
        let batch = timeout(WAIT, applied.recv()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(mirror.snapshot(), json!({"items": [1, 2]}));
        // Only the origin publishes: one batch in, one batch applied.
        sleep(Duration::from_millis(30)).await;
        assert!(applied.try_recv().is_err());
        assert_eq!(mirror.snapshot(), json!({"items": [1, 2]}));
    }

    #[tokio::test]
    async fn scalars_cannot_be_published() {
        let (a, _b) = Port::pair(PortOptions::new(HandshakeLevel::None, false)).unwrap();
        let scalar = LiveValue::new(json!(5));
        let err = a
            .publish(&scalar, &EventId::from_string("e"), LiveOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PortError::Configuration(ConfigurationError::NotStructured)
        ));
    }
}
