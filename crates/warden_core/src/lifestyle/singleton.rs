//! Singleton lifestyle: one lazily created instance shared by every caller.
//!
//! # Invariants
//! - The factory runs at most once per successful creation; concurrent first
//!   resolutions wait on the creation lock and observe the cached instance.
//! - A failed creation leaves the cache empty so the next call retries.

use super::{Creation, Lease, LifestyleManager};
use crate::error::KernelResult;
use crate::model::descriptor::ComponentDescriptor;
use crate::model::instance::Activation;
use crate::registry::events::KernelEvent;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub struct SingletonLifestyle {
    descriptor: Arc<ComponentDescriptor>,
    cache: RwLock<Option<Creation>>,
    creation_lock: Mutex<()>,
}

impl SingletonLifestyle {
    pub(crate) fn new(descriptor: Arc<ComponentDescriptor>) -> Self {
        Self {
            descriptor,
            cache: RwLock::new(None),
            creation_lock: Mutex::new(()),
        }
    }

    fn cached(&self) -> Option<Activation> {
        self.cache
            .read()
            .as_ref()
            .map(|creation| creation.activation().clone())
    }
}

impl LifestyleManager for SingletonLifestyle {
    fn resolve(&self, create: &mut dyn FnMut() -> KernelResult<Creation>) -> KernelResult<Lease> {
        if let Some(activation) = self.cached() {
            return Ok(Lease::shared(activation));
        }

        let _creating = self.creation_lock.lock();
        if let Some(activation) = self.cached() {
            return Ok(Lease::shared(activation));
        }

        let creation = create()?;
        let activation = creation.activation().clone();
        *self.cache.write() = Some(creation);
        Ok(Lease::shared(activation))
    }

    fn release(&self, _activation: &Activation, _events: &mut Vec<KernelEvent>) -> bool {
        false
    }

    fn dispose(&self, events: &mut Vec<KernelEvent>) {
        let _creating = self.creation_lock.lock();
        let cached = self.cache.write().take();
        if let Some(creation) = cached {
            creation.destroy(&self.descriptor, events);
        }
    }

    fn live_count(&self) -> usize {
        usize::from(self.cache.read().is_some())
    }
}
