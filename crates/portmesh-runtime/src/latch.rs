//! One-shot readiness latches.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

enum Waiter {
    Task(oneshot::Sender<()>),
    Callback(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct LatchState {
    fired: bool,
    waiters: Vec<Waiter>,
}

/// A boolean that flips false → true exactly once, waking every waiter.
#[derive(Default)]
pub struct Latch {
    state: Mutex<LatchState>,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the latch. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            match waiter {
                Waiter::Task(sender) => {
                    let _ = sender.send(());
                }
                Waiter::Callback(callback) => callback(),
            }
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Future resolving once the latch fires. Resolves immediately when it
    /// already has, and also when the latch is dropped unfired.
    pub fn wait(&self) -> LatchWait {
        let mut state = self.state.lock();
        if state.fired {
            return LatchWait { receiver: None };
        }
        let (sender, receiver) = oneshot::channel();
        state.waiters.push(Waiter::Task(sender));
        LatchWait {
            receiver: Some(receiver),
        }
    }

    /// Run `callback` when the latch fires, or right away if it has.
    pub fn on_fire(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock();
            if !state.fired {
                state.waiters.push(Waiter::Callback(Box::new(callback)));
                return;
            }
        }
        callback();
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("fired", &self.is_fired())
            .finish()
    }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct LatchWait {
    receiver: Option<oneshot::Receiver<()>>,
}

impl Future for LatchWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.receiver.as_mut() {
            None => Poll::Ready(()),
            Some(receiver) => Pin::new(receiver).poll(cx).map(|_| ()),
        }
    }
}

/// The four public latches of a port, plus the gate that lets its inbound
/// pump start reading.
#[derive(Debug, Default)]
pub(crate) struct Readiness {
    pub(crate) open: Latch,
    pub(crate) messaging: Latch,
    pub(crate) error: Latch,
    pub(crate) closed: Latch,
    pub(crate) receiving: Latch,
}

/// Latch selector for [`crate::Port::ready_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStateQuery {
    Open,
    Messaging,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

impl Readiness {
    pub(crate) fn latch(&self, query: ReadyStateQuery) -> &Latch {
        match query {
            ReadyStateQuery::Open => &self.open,
            ReadyStateQuery::Messaging => &self.messaging,
            ReadyStateQuery::Error => &self.error,
            ReadyStateQuery::Closed => &self.closed,
        }
    }

    pub(crate) fn state(&self) -> ReadyState {
        if self.closed.is_fired() {
            ReadyState::Closed
        } else if self.open.is_fired() {
            ReadyState::Open
        } else {
            ReadyState::Connecting
        }
    }
}

/// One-shot cancellation shared between a caller and the registrations it
/// wants to tear down.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<Latch>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_fired()
    }

    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        self.0.on_fire(callback);
    }

    pub fn cancelled(&self) -> LatchWait {
        self.0.wait()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelSignal")
            .field(&self.is_cancelled())
            .finish()
    }
}
