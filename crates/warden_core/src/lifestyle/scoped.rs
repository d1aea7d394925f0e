//! Scoped lifestyle: at most one instance per scope key.
//!
//! # Invariants
//! - Within one scope every resolve returns the same instance.
//! - Ending a scope destroys exactly the instances created within it.
//! - Explicit scopes must be active on the resolving thread.
//! - A per-thread scope ends when `end_thread_scope` is called or when its
//!   thread exits, whichever comes first.

use super::{Creation, Lease, LifestyleManager};
use crate::error::{KernelError, KernelResult};
use crate::model::descriptor::{ComponentDescriptor, ScopeKind};
use crate::model::instance::Activation;
use crate::registry::events::KernelEvent;
use crate::registry::RegistryLink;
use crate::scope::{self, ScopeKey};
use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SCOPED_ID: AtomicU64 = AtomicU64::new(1);

type Slots = Mutex<HashMap<ScopeKey, Arc<OnceCell<Creation>>>>;

pub struct ScopedLifestyle {
    id: u64,
    descriptor: Arc<ComponentDescriptor>,
    kind: ScopeKind,
    owner: RegistryLink,
    instances: Arc<Slots>,
}

impl ScopedLifestyle {
    pub(crate) fn new(
        descriptor: Arc<ComponentDescriptor>,
        kind: ScopeKind,
        owner: RegistryLink,
    ) -> Self {
        Self {
            id: NEXT_SCOPED_ID.fetch_add(1, Ordering::Relaxed),
            descriptor,
            kind,
            owner,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ends this thread's slot when the thread exits without ending it.
    fn end_on_thread_exit(&self) {
        let instances = Arc::downgrade(&self.instances);
        let descriptor = self.descriptor.clone();
        let hub = self.owner.events.clone();
        scope::on_thread_exit(self.id, move |scope| {
            let Some(instances) = instances.upgrade() else {
                return;
            };
            let slot = instances.lock().remove(&scope);
            let Some(creation) = slot.as_deref().and_then(OnceCell::get) else {
                return;
            };
            debug!(
                "event=scope_instance_end module=lifestyle status=ok key={} scope={} reason=thread_exit",
                descriptor.key(),
                scope
            );
            let mut events = Vec::new();
            creation.destroy(&descriptor, &mut events);
            if let Some(hub) = hub.upgrade() {
                hub.dispatch(events);
            }
        });
    }

    fn active_scope(&self) -> KernelResult<ScopeKey> {
        match self.kind {
            ScopeKind::Thread => Ok(ScopeKey::current_thread()),
            ScopeKind::Explicit => {
                scope::current_explicit(self.owner.id).ok_or_else(|| KernelError::ScopeNotActive {
                    key: self.descriptor.key().to_string(),
                })
            }
        }
    }
}

impl LifestyleManager for ScopedLifestyle {
    fn resolve(&self, create: &mut dyn FnMut() -> KernelResult<Creation>) -> KernelResult<Lease> {
        let scope = self.active_scope()?;
        let (slot, opened) = match self.instances.lock().entry(scope) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(Arc::default()).clone(), true),
        };
        if opened && self.kind == ScopeKind::Thread {
            self.end_on_thread_exit();
        }
        let creation = slot.get_or_try_init(|| create())?;
        Ok(Lease::shared(creation.activation().clone()))
    }

    fn release(&self, _activation: &Activation, _events: &mut Vec<KernelEvent>) -> bool {
        false
    }

    fn end_scope(&self, scope: ScopeKey, events: &mut Vec<KernelEvent>) {
        let slot = self.instances.lock().remove(&scope);
        if let Some(creation) = slot.as_deref().and_then(OnceCell::get) {
            debug!(
                "event=scope_instance_end module=lifestyle status=ok key={} scope={}",
                self.descriptor.key(),
                scope
            );
            creation.destroy(&self.descriptor, events);
        }
    }

    fn dispose(&self, events: &mut Vec<KernelEvent>) {
        let mut slots: Vec<(ScopeKey, Arc<OnceCell<Creation>>)> =
            self.instances.lock().drain().collect();
        slots.sort_by_key(|(scope, _)| std::cmp::Reverse(*scope));
        for (_, slot) in slots {
            if let Some(creation) = slot.get() {
                creation.destroy(&self.descriptor, events);
            }
        }
    }

    fn live_count(&self) -> usize {
        self.instances
            .lock()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::ScopedLifestyle;
    use crate::error::KernelError;
    use crate::lifestyle::test_support::{counting_descriptor, fresh_creation};
    use crate::lifestyle::LifestyleManager;
    use crate::model::descriptor::{Lifestyle, ScopeKind};
    use crate::registry::RegistryLink;
    use crate::scope::ScopeKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn per_thread_scope_caches_until_scope_end() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let lifestyle = Arc::new(ScopedLifestyle::new(
            counting_descriptor(
                Lifestyle::Scoped {
                    scope: ScopeKind::Thread,
                },
                destroyed.clone(),
            ),
            ScopeKind::Thread,
            RegistryLink::detached(),
        ));

        let here_a = lifestyle
            .resolve(&mut || Ok(fresh_creation()))
            .expect("resolve on this thread");
        let here_b = lifestyle
            .resolve(&mut || Ok(fresh_creation()))
            .expect("cached on this thread");
        assert_eq!(here_a.activation().id(), here_b.activation().id());

        let remote = lifestyle.clone();
        let there = std::thread::spawn(move || {
            remote
                .resolve(&mut || Ok(fresh_creation()))
                .expect("resolve on other thread")
                .activation()
                .id()
        })
        .join()
        .expect("thread joins");
        assert_ne!(here_a.activation().id(), there);
        // The other thread's slot ended with its thread.
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(lifestyle.live_count(), 1);

        let mut events = Vec::new();
        lifestyle.end_scope(ScopeKey::current_thread(), &mut events);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(lifestyle.live_count(), 0);

        lifestyle.dispose(&mut events);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn explicit_scope_requires_active_scope() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let lifestyle = ScopedLifestyle::new(
            counting_descriptor(
                Lifestyle::Scoped {
                    scope: ScopeKind::Explicit,
                },
                destroyed,
            ),
            ScopeKind::Explicit,
            RegistryLink::detached(),
        );

        let err = lifestyle
            .resolve(&mut || Ok(fresh_creation()))
            .expect_err("no scope is active");
        assert!(matches!(err, KernelError::ScopeNotActive { .. }));
    }
}
