//! Pluggable creation/caching policies.
//!
//! # Responsibility
//! - Decide whether a resolution creates a new instance or returns a cached
//!   one, and what releasing an instance means.
//! - Own cached instances (and the dependency burdens created for them) until
//!   disposal.
//!
//! # Invariants
//! - A failed creation is never cached; the next resolve retries.
//! - Factory failures propagate unchanged to the resolving caller.
//! - Only leases with `release_required` are tracked by the release policy.

use crate::error::KernelResult;
use crate::model::descriptor::{ComponentDescriptor, Lifestyle};
use crate::model::instance::Activation;
use crate::registry::events::KernelEvent;
use crate::registry::RegistryLink;
use crate::release::Burden;
use crate::scope::ScopeKey;
use log::debug;
use std::sync::Arc;

mod pooled;
mod scoped;
mod singleton;
mod transient;

pub use pooled::PooledLifestyle;
pub use scoped::ScopedLifestyle;
pub use singleton::SingletonLifestyle;
pub use transient::TransientLifestyle;

/// Freshly built instance together with the dependency burden created for it.
pub struct Creation {
    activation: Activation,
    dependencies: Vec<Burden>,
}

impl Creation {
    pub(crate) fn new(activation: Activation, dependencies: Vec<Burden>) -> Self {
        Self {
            activation,
            dependencies,
        }
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    /// Destroys the instance, then releases its dependencies newest first.
    pub(crate) fn destroy(
        &self,
        descriptor: &Arc<ComponentDescriptor>,
        events: &mut Vec<KernelEvent>,
    ) {
        destroy_activation(descriptor, &self.activation, events);
        for dependency in self.dependencies.iter().rev() {
            dependency.release(events);
        }
    }
}

/// Result of one lifestyle resolution.
#[derive(Debug)]
pub struct Lease {
    activation: Activation,
    dependencies: Vec<Burden>,
    release_required: bool,
}

impl Lease {
    /// Caller owns the instance and its dependency burden.
    pub(crate) fn owned(creation: Creation) -> Self {
        Self {
            activation: creation.activation,
            dependencies: creation.dependencies,
            release_required: true,
        }
    }

    /// Lifestyle keeps ownership; release is a no-op for callers.
    pub(crate) fn shared(activation: Activation) -> Self {
        Self {
            activation,
            dependencies: Vec::new(),
            release_required: false,
        }
    }

    /// Lifestyle keeps ownership but expects the instance back.
    pub(crate) fn borrowed(activation: Activation) -> Self {
        Self {
            activation,
            dependencies: Vec::new(),
            release_required: true,
        }
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    pub fn release_required(&self) -> bool {
        self.release_required
    }

    pub(crate) fn into_parts(self) -> (Activation, Vec<Burden>, bool) {
        (self.activation, self.dependencies, self.release_required)
    }
}

/// Creation/caching policy attached to one handler.
pub trait LifestyleManager: Send + Sync {
    /// Returns a cached instance or runs `create` to build one.
    fn resolve(&self, create: &mut dyn FnMut() -> KernelResult<Creation>) -> KernelResult<Lease>;

    /// Takes back an instance vended with `release_required`.
    ///
    /// Returns whether the lifestyle recognized the instance.
    fn release(&self, activation: &Activation, events: &mut Vec<KernelEvent>) -> bool;

    /// Disposes instances created within `scope`.
    fn end_scope(&self, _scope: ScopeKey, _events: &mut Vec<KernelEvent>) {}

    /// Disposes every instance this lifestyle still owns.
    fn dispose(&self, events: &mut Vec<KernelEvent>);

    /// Number of instances currently owned by the lifestyle.
    fn live_count(&self) -> usize;
}

/// Builds the lifestyle manager declared by `descriptor`.
pub(crate) fn manager_for(
    descriptor: &Arc<ComponentDescriptor>,
    owner: &RegistryLink,
) -> Box<dyn LifestyleManager> {
    match descriptor.lifestyle() {
        Lifestyle::Transient => Box::new(TransientLifestyle::new(descriptor.clone())),
        Lifestyle::Singleton => Box::new(SingletonLifestyle::new(descriptor.clone())),
        Lifestyle::Scoped { scope } => {
            Box::new(ScopedLifestyle::new(descriptor.clone(), scope, owner.clone()))
        }
        Lifestyle::Pooled {
            max_size,
            on_exhausted,
        } => Box::new(PooledLifestyle::new(
            descriptor.clone(),
            max_size,
            on_exhausted,
        )),
    }
}

/// Runs the activator's disposal hook and records the destroyed event.
pub(crate) fn destroy_activation(
    descriptor: &Arc<ComponentDescriptor>,
    activation: &Activation,
    events: &mut Vec<KernelEvent>,
) {
    if !descriptor.activator().owns_instances() {
        debug!(
            "event=instance_destroy module=lifestyle status=skipped key={} reason=external instance={}",
            descriptor.key(),
            activation.id()
        );
        return;
    }
    descriptor.activator().destroy(activation.raw());
    debug!(
        "event=instance_destroy module=lifestyle status=ok key={} lifestyle={} instance={}",
        descriptor.key(),
        descriptor.lifestyle().label(),
        activation.id()
    );
    events.push(KernelEvent::InstanceDestroyed {
        descriptor: descriptor.clone(),
        instance: activation.instance().clone(),
    });
}
