//! Registry arena, indexes and handler validity propagation.
//!
//! # Responsibility
//! - Hold the handler arena, the key index and the service index.
//! - Recompute handler validity after every structural change.
//!
//! # Invariants
//! - Handler ids grow monotonically and are never reused, so ascending id
//!   order is registration order.
//! - Unregistered handlers leave no entry behind.
//! - After `recompute`, a handler is `Valid` iff every required dependency
//!   is satisfied by a `Valid` handler or a sub-resolver (least fixed point:
//!   handlers that only support each other stay waiting).

use crate::config::SelectionPolicy;
use crate::handler::{Handler, HandlerId, HandlerState};
use crate::model::descriptor::{ComponentDescriptor, DependencySpec};
use crate::resolver::SubDependencyResolver;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// One handler whose state changed during a recompute.
pub(crate) struct StateChange {
    pub(crate) handler: Arc<Handler>,
    pub(crate) previous: HandlerState,
}

pub(crate) struct RegistryState {
    handlers: BTreeMap<HandlerId, Arc<Handler>>,
    next_id: HandlerId,
    by_key: HashMap<String, HandlerId>,
    by_service: HashMap<String, Vec<HandlerId>>,
    sub_resolvers: Vec<Arc<dyn SubDependencyResolver>>,
    selection: SelectionPolicy,
    pub(crate) disposed: bool,
}

impl RegistryState {
    pub(crate) fn new(selection: SelectionPolicy) -> Self {
        Self {
            handlers: BTreeMap::new(),
            next_id: 0,
            by_key: HashMap::new(),
            by_service: HashMap::new(),
            sub_resolvers: Vec::new(),
            selection,
            disposed: false,
        }
    }

    pub(crate) fn next_id(&self) -> HandlerId {
        self.next_id
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn insert(&mut self, handler: Arc<Handler>) {
        let id = handler.id();
        debug_assert!(id >= self.next_id);
        self.next_id = id + 1;
        self.by_key.insert(handler.key().to_string(), id);
        for service in handler.descriptor().services() {
            self.by_service.entry(service.clone()).or_default().push(id);
        }
        self.handlers.insert(id, handler);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Arc<Handler>> {
        let id = self.by_key.remove(key)?;
        let handler = self.handlers.remove(&id)?;
        for service in handler.descriptor().services() {
            if let Some(ids) = self.by_service.get_mut(service) {
                ids.retain(|candidate| *candidate != id);
                if ids.is_empty() {
                    self.by_service.remove(service);
                }
            }
        }
        Some(handler)
    }

    /// Empties the arena, returning live handlers newest first.
    pub(crate) fn drain_newest_first(&mut self) -> Vec<Arc<Handler>> {
        self.by_key.clear();
        self.by_service.clear();
        std::mem::take(&mut self.handlers).into_values().rev().collect()
    }

    pub(crate) fn handler(&self, key: &str) -> Option<&Arc<Handler>> {
        let id = self.by_key.get(key)?;
        self.slot(*id)
    }

    fn slot(&self, id: HandlerId) -> Option<&Arc<Handler>> {
        self.handlers.get(&id)
    }

    /// Live handlers in registration order.
    pub(crate) fn handlers(&self) -> impl DoubleEndedIterator<Item = &Arc<Handler>> {
        self.handlers.values()
    }

    /// Handlers exposing `service`, in registration order.
    pub(crate) fn handlers_for(&self, service: &str) -> Vec<&Arc<Handler>> {
        self.by_service
            .get(service)
            .map(|ids| ids.iter().filter_map(|id| self.slot(*id)).collect())
            .unwrap_or_default()
    }

    /// Handlers exposing `service`, in selection preference order.
    pub(crate) fn ordered_candidates(&self, service: &str) -> Vec<&Arc<Handler>> {
        let mut candidates = self.handlers_for(service);
        if self.selection == SelectionPolicy::MostRecent {
            candidates.reverse();
        }
        candidates
    }

    pub(crate) fn sub_resolvers(&self) -> &[Arc<dyn SubDependencyResolver>] {
        &self.sub_resolvers
    }

    pub(crate) fn add_sub_resolver(&mut self, resolver: Arc<dyn SubDependencyResolver>) {
        self.sub_resolvers.push(resolver);
    }

    pub(crate) fn all_ids(&self) -> Vec<HandlerId> {
        self.handlers().map(|handler| handler.id()).collect()
    }

    /// Live handlers with a dependency that `descriptor` could satisfy.
    pub(crate) fn dependents_of(&self, descriptor: &ComponentDescriptor) -> Vec<HandlerId> {
        self.handlers()
            .filter(|handler| handler.descriptor().depends_on(descriptor))
            .map(|handler| handler.id())
            .collect()
    }

    fn dependency_satisfied(
        &self,
        descriptor: &ComponentDescriptor,
        dependency: &DependencySpec,
        valid: &HashSet<HandlerId>,
    ) -> bool {
        if !dependency.blocks_validity() {
            return true;
        }
        if self
            .sub_resolvers
            .iter()
            .any(|resolver| resolver.can_resolve(descriptor, dependency))
        {
            return true;
        }
        match dependency.name_hint.as_deref() {
            Some(hint) => self.handler(hint).is_some_and(|handler| {
                handler.descriptor().provides(&dependency.service) && valid.contains(&handler.id())
            }),
            None => self
                .by_service
                .get(&dependency.service)
                .is_some_and(|ids| ids.iter().any(|id| valid.contains(id))),
        }
    }

    fn unsatisfied(&self, handler: &Handler, valid: &HashSet<HandlerId>) -> Vec<String> {
        let descriptor = handler.descriptor();
        descriptor
            .dependencies()
            .iter()
            .filter(|dependency| !self.dependency_satisfied(descriptor, dependency, valid))
            .map(DependencySpec::describe)
            .collect()
    }

    /// Re-evaluates `seeds` and everything transitively depending on them.
    ///
    /// Affected handlers are reset to waiting and re-validated breadth-first;
    /// handlers outside the affected set keep their state.
    pub(crate) fn recompute(&self, seeds: Vec<HandlerId>) -> Vec<StateChange> {
        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<HandlerId> = seeds.into();
        while let Some(id) = queue.pop_front() {
            let Some(handler) = self.slot(id) else {
                continue;
            };
            if affected.insert(id) {
                queue.extend(self.dependents_of(handler.descriptor()));
            }
        }

        let mut valid: HashSet<HandlerId> = self
            .handlers()
            .filter(|handler| !affected.contains(&handler.id()) && handler.is_valid())
            .map(|handler| handler.id())
            .collect();

        let mut pending: VecDeque<HandlerId> = affected.iter().copied().collect();
        while let Some(id) = pending.pop_front() {
            if valid.contains(&id) {
                continue;
            }
            let Some(handler) = self.slot(id) else {
                continue;
            };
            if self.unsatisfied(handler, &valid).is_empty() {
                valid.insert(id);
                pending.extend(
                    self.dependents_of(handler.descriptor())
                        .into_iter()
                        .filter(|dependent| affected.contains(dependent) && !valid.contains(dependent)),
                );
            }
        }

        let mut changes = Vec::new();
        for id in affected {
            let Some(handler) = self.slot(id) else {
                continue;
            };
            let previous = handler.state();
            let (state, missing) = if valid.contains(&id) {
                (HandlerState::Valid, Vec::new())
            } else {
                (HandlerState::WaitingDependency, self.unsatisfied(handler, &valid))
            };
            handler.set_state(state, missing);
            if previous != state {
                changes.push(StateChange {
                    handler: handler.clone(),
                    previous,
                });
            }
        }
        changes
    }
}
