//! Opaque handles moved alongside a message on transports that can carry
//! live objects natively.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Transferable(Arc<dyn Any + Send + Sync>);

impl Transferable {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transferable").finish_non_exhaustive()
    }
}
