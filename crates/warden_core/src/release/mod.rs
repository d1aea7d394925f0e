//! Burden tracking and cascading release.
//!
//! # Responsibility
//! - Record the dependency instances created while satisfying one request.
//! - Track root instances that need caller-driven release.
//! - Release a root and its burden in LIFO order, exactly once.
//!
//! # Invariants
//! - Only leases with `release_required` (transient, pooled) become burdens;
//!   singleton and scoped instances stay with their lifestyle.
//! - `Burden::release` is one-shot; a second call is a no-op.
//! - Dependents are released before the things they depended on.

use crate::handler::Handler;
use crate::model::instance::{Activation, InstanceId};
use crate::registry::events::KernelEvent;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One vended instance, its owning handler, and what was created for it.
pub struct Burden {
    activation: Activation,
    handler: Arc<Handler>,
    dependencies: Vec<Burden>,
    released: AtomicBool,
}

impl Burden {
    pub(crate) fn new(
        activation: Activation,
        handler: Arc<Handler>,
        dependencies: Vec<Burden>,
    ) -> Self {
        Self {
            activation,
            handler,
            dependencies,
            released: AtomicBool::new(false),
        }
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub fn dependencies(&self) -> &[Burden] {
        &self.dependencies
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the instance through its lifestyle, then its dependencies
    /// newest first. Returns `false` when already released.
    pub fn release(&self, events: &mut Vec<KernelEvent>) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.handler
            .lifestyle()
            .release(&self.activation, events);
        for dependency in self.dependencies.iter().rev() {
            dependency.release(events);
        }
        true
    }
}

impl Debug for Burden {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Burden")
            .field("key", &self.handler.key())
            .field("instance", &self.activation.id())
            .field("dependencies", &self.dependencies)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Root burdens awaiting caller-driven release.
#[derive(Default)]
pub struct ReleasePolicy {
    tracked: Mutex<TrackedBurdens>,
}

#[derive(Default)]
struct TrackedBurdens {
    next_sequence: u64,
    entries: HashMap<InstanceId, (u64, Burden)>,
}

impl ReleasePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&self, burden: Burden) {
        let mut tracked = self.tracked.lock();
        let sequence = tracked.next_sequence;
        tracked.next_sequence += 1;
        tracked
            .entries
            .insert(burden.activation.id(), (sequence, burden));
    }

    pub fn is_tracked(&self, id: InstanceId) -> bool {
        self.tracked.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tracked.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases the root burden for `id`; untracked ids are a no-op.
    pub fn release(&self, id: InstanceId, events: &mut Vec<KernelEvent>) -> bool {
        let entry = self.tracked.lock().entries.remove(&id);
        match entry {
            Some((_, burden)) => {
                debug!(
                    "event=instance_release module=release status=ok key={} instance={} dependencies={}",
                    burden.handler.key(),
                    id,
                    burden.dependencies.len()
                );
                burden.release(events)
            }
            None => false,
        }
    }

    /// Releases every tracked burden, most recently tracked first.
    pub fn release_all(&self, events: &mut Vec<KernelEvent>) -> usize {
        let mut drained: Vec<(u64, Burden)> = {
            let mut tracked = self.tracked.lock();
            tracked.entries.drain().map(|(_, entry)| entry).collect()
        };
        drained.sort_by_key(|(sequence, _)| std::cmp::Reverse(*sequence));

        let count = drained.len();
        for (_, burden) in drained {
            burden.release(events);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::{Burden, ReleasePolicy};
    use crate::handler::Handler;
    use crate::model::descriptor::{ComponentDescriptor, Lifestyle, RegistrationRecord};
    use crate::model::instance::{instance, Activation, FnActivator, Instance, InstanceId};
    use crate::registry::events::KernelEvent;
    use crate::registry::RegistryLink;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording_handler(key: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Handler> {
        let name = key.to_string();
        let activator = FnActivator::new(|_| Ok(instance(()))).on_destroy(move |_: &Instance| {
            log.lock().push(name.clone());
        });
        let descriptor = ComponentDescriptor::new(
            RegistrationRecord::new(key, "Recorder").lifestyle(Lifestyle::Transient),
            activator,
        )
        .expect("valid descriptor");
        Arc::new(Handler::new(0, Arc::new(descriptor), &RegistryLink::detached()))
    }

    fn burden(handler: &Arc<Handler>, dependencies: Vec<Burden>) -> Burden {
        Burden::new(
            Activation::new(instance(())),
            handler.clone(),
            dependencies,
        )
    }

    #[test]
    fn release_cascades_lifo_and_is_one_shot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = recording_handler("root", log.clone());
        let first = recording_handler("first", log.clone());
        let second = recording_handler("second", log.clone());
        let leaf = recording_handler("leaf", log.clone());

        let tree = burden(
            &root,
            vec![
                burden(&first, vec![burden(&leaf, Vec::new())]),
                burden(&second, Vec::new()),
            ],
        );

        let mut events = Vec::new();
        assert!(tree.release(&mut events));
        assert!(!tree.release(&mut events));
        assert_eq!(*log.lock(), vec!["root", "second", "first", "leaf"]);
        assert_eq!(events.len(), 4);
        assert!(events
            .iter()
            .all(|event| matches!(event, KernelEvent::InstanceDestroyed { .. })));
    }

    #[test]
    fn policy_release_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recording_handler("root", log.clone());
        let tracked = burden(&handler, Vec::new());
        let id = tracked.activation().id();

        let policy = ReleasePolicy::new();
        policy.track(tracked);
        assert!(policy.is_tracked(id));

        let mut events = Vec::new();
        assert!(policy.release(id, &mut events));
        assert!(!policy.release(id, &mut events));
        assert!(!policy.release(InstanceId::of(&instance(())), &mut events));
        assert_eq!(log.lock().len(), 1);
        assert!(policy.is_empty());
    }

    #[test]
    fn release_all_goes_newest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let older = recording_handler("older", log.clone());
        let newer = recording_handler("newer", log.clone());

        let policy = ReleasePolicy::new();
        policy.track(burden(&older, Vec::new()));
        policy.track(burden(&newer, Vec::new()));

        let mut events = Vec::new();
        assert_eq!(policy.release_all(&mut events), 2);
        assert_eq!(*log.lock(), vec!["newer", "older"]);
    }
}
