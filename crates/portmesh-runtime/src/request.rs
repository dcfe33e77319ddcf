//! Request/response over a private reply channel.

use crate::dispose::Disposer;
use crate::event::MessageEvent;
use crate::latch::CancelSignal;
use crate::port::{ListenerId, ListenerOptions, Port, SendOptions};
use async_trait::async_trait;
use futures_util::future::{self, BoxFuture};
use parking_lot::Mutex;
use portmesh_protocol::{MESSAGE_TYPE, PortError, PortOptions, PortResult};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Produces the response to one request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, event: MessageEvent) -> Value;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(MessageEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    async fn handle(&self, event: MessageEvent) -> Value {
        (self)(event).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Envelope settings for the request itself. The reply port is added in
    /// front of any ports already listed.
    pub send: SendOptions,
    pub signal: Option<CancelSignal>,
}

impl Port {
    /// Send `payload` with a reply port attached and resolve with the first
    /// response. The request goes out before this returns.
    pub fn post_request(
        &self,
        payload: Value,
        options: RequestOptions,
    ) -> BoxFuture<'static, PortResult<Value>> {
        match self.begin_request(payload, options) {
            Ok(response) => response,
            Err(error) => Box::pin(future::ready(Err(error))),
        }
    }

    fn begin_request(
        &self,
        payload: Value,
        options: RequestOptions,
    ) -> PortResult<BoxFuture<'static, PortResult<Value>>> {
        let (reply_local, reply_remote) = Port::pair(PortOptions::internal())?;
        let (local, remote) = (reply_local.clone(), reply_remote.clone());
        let release = Disposer::new(move || {
            local.close();
            remote.close();
        });

        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let answered = release.clone();
        reply_local.listen(MESSAGE_TYPE, ListenerOptions::once(), move |event| {
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(event.data().clone());
            }
            answered.dispose();
        });
        let abandoned = release.clone();
        reply_local
            .inner
            .readiness
            .closed
            .on_fire(move || abandoned.dispose());

        if let Some(signal) = &options.signal {
            let cancelled = release.clone();
            signal.on_cancel(move || cancelled.dispose());
        }

        let mut send = options.send;
        send.transfer.insert(0, reply_remote);
        if let Err(error) = self.send(payload, send) {
            release.dispose();
            return Err(error);
        }
        self.defer(release);
        Ok(Box::pin(async move {
            receiver.await.map_err(|_| PortError::RequestCancelled)
        }))
    }

    /// Answer requests of `event_type` with `handler`'s result.
    pub fn add_request_listener(
        &self,
        event_type: &str,
        handler: impl RequestHandler,
    ) -> PortResult<ListenerId> {
        let handler = Arc::new(handler);
        let runtime = self.inner.runtime.clone();
        self.add_event_listener(event_type, ListenerOptions::default(), move |event| {
            let handler = Arc::clone(&handler);
            let event = event.clone();
            runtime.spawn(async move {
                let response = handler.handle(event.clone()).await;
                if !event.respond_with(response) {
                    debug!(event_id = %event.event_id(), "request had no open reply port");
                }
            });
        })
    }
}
