use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Teardown = Box<dyn FnOnce() + Send>;

/// Handle that undoes a registration. Disposing twice is a no-op; clones
/// share the same teardown.
#[derive(Clone)]
pub struct Disposer(Arc<Mutex<Option<Teardown>>>);

impl Disposer {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(teardown)))))
    }

    pub fn noop() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub fn dispose(&self) {
        let teardown = self.0.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.0.lock().is_none()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
