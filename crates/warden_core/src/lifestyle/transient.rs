//! Transient lifestyle: every resolve creates, the caller owns the result.

use super::{destroy_activation, Creation, Lease, LifestyleManager};
use crate::error::KernelResult;
use crate::model::descriptor::ComponentDescriptor;
use crate::model::instance::Activation;
use crate::registry::events::KernelEvent;
use std::sync::Arc;

/// Stateless policy; safe for unbounded concurrent use.
pub struct TransientLifestyle {
    descriptor: Arc<ComponentDescriptor>,
}

impl TransientLifestyle {
    pub(crate) fn new(descriptor: Arc<ComponentDescriptor>) -> Self {
        Self { descriptor }
    }
}

impl LifestyleManager for TransientLifestyle {
    fn resolve(&self, create: &mut dyn FnMut() -> KernelResult<Creation>) -> KernelResult<Lease> {
        Ok(Lease::owned(create()?))
    }

    fn release(&self, activation: &Activation, events: &mut Vec<KernelEvent>) -> bool {
        destroy_activation(&self.descriptor, activation, events);
        true
    }

    fn dispose(&self, _events: &mut Vec<KernelEvent>) {}

    fn live_count(&self) -> usize {
        0
    }
}
