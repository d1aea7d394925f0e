//! Dependency resolution for one component activation.
//!
//! # Responsibility
//! - Satisfy each declared dependency in declaration order, consulting
//!   sub-resolvers first and the registry second.
//! - Select among competing handlers deterministically.
//! - Track the per-call-chain resolution stack for cycle detection.
//!
//! # Invariants
//! - A handler already on the stack is never selected again in the same
//!   chain; if it is the only usable candidate the request fails with
//!   `CircularDependency` instead of recursing.
//! - The resolution context is never shared between call chains.
//! - On failure, instances created for earlier dependencies of the same
//!   request are released before the error is returned.

use crate::error::{KernelError, KernelResult};
use crate::handler::{Handler, HandlerId};
use crate::lifestyle::Lease;
use crate::model::descriptor::{ComponentDescriptor, DependencySpec};
use crate::model::instance::{ActivationError, Instance, ResolvedDependencies, ResolvedDependency};
use crate::registry::events::KernelEvent;
use crate::registry::state::RegistryState;
use crate::release::Burden;
use log::warn;
use std::sync::Arc;

/// Custom dependency source consulted before the registry.
pub trait SubDependencyResolver: Send + Sync {
    /// Whether this resolver supplies `dependency` for `descriptor`.
    ///
    /// Must be a pure function of its arguments: the answer also decides
    /// handler validity.
    fn can_resolve(&self, descriptor: &ComponentDescriptor, dependency: &DependencySpec) -> bool;

    fn resolve(
        &self,
        descriptor: &ComponentDescriptor,
        dependency: &DependencySpec,
    ) -> Result<Instance, ActivationError>;
}

/// Per-call-chain resolution state.
#[derive(Debug, Default)]
pub struct ResolutionContext {
    stack: Vec<(HandlerId, String)>,
    events: Vec<KernelEvent>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&mut self, id: HandlerId, key: &str) {
        self.stack.push((id, key.to_string()));
    }

    pub(crate) fn leave(&mut self) {
        self.stack.pop();
    }

    pub fn on_stack(&self, id: HandlerId) -> bool {
        self.stack.iter().any(|(active, _)| *active == id)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Keys from the outermost active handler to `key`.
    fn path_to(&self, key: &str) -> Vec<String> {
        let mut path: Vec<String> = self.stack.iter().map(|(_, active)| active.clone()).collect();
        path.push(key.to_string());
        path
    }

    pub(crate) fn push_event(&mut self, event: KernelEvent) {
        self.events.push(event);
    }

    pub(crate) fn events_mut(&mut self) -> &mut Vec<KernelEvent> {
        &mut self.events
    }

    pub(crate) fn take_events(&mut self) -> Vec<KernelEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Outcome of choosing a handler for one service request.
pub(crate) enum Selection {
    Found(Arc<Handler>),
    /// Only candidates already on the resolution stack are usable.
    OnStack(Arc<Handler>),
    /// Candidates exist but none is valid.
    NotValid(Arc<Handler>),
    None,
}

/// Picks a handler: name hint, then the registry's ordering policy.
pub(crate) fn select(
    state: &RegistryState,
    service: &str,
    name_hint: Option<&str>,
    context: &ResolutionContext,
) -> Selection {
    let candidates: Vec<&Arc<Handler>> = match name_hint {
        Some(hint) => state
            .handler(hint)
            .filter(|handler| handler.descriptor().provides(service))
            .into_iter()
            .collect(),
        None => state.ordered_candidates(service),
    };

    let mut on_stack = None;
    let mut waiting = None;
    for handler in candidates {
        if !handler.is_valid() {
            waiting.get_or_insert(handler);
            continue;
        }
        if context.on_stack(handler.id()) {
            on_stack.get_or_insert(handler);
            continue;
        }
        return Selection::Found(handler.clone());
    }

    match (on_stack, waiting) {
        (Some(handler), _) => Selection::OnStack(handler.clone()),
        (None, Some(handler)) => Selection::NotValid(handler.clone()),
        (None, None) => Selection::None,
    }
}

/// Resolves every dependency of `descriptor` in declaration order.
///
/// Returns the values for the activator and the burden of instances created
/// solely for this request.
pub(crate) fn resolve_dependencies(
    descriptor: &ComponentDescriptor,
    state: &RegistryState,
    context: &mut ResolutionContext,
) -> KernelResult<(ResolvedDependencies, Vec<Burden>)> {
    let mut resolved = ResolvedDependencies::default();
    let mut burden = Vec::new();

    for dependency in descriptor.dependencies() {
        match resolve_one(descriptor, dependency, state, context, &mut burden) {
            Ok(value) => resolved.push(dependency.clone(), value),
            Err(err) => {
                warn!(
                    "event=dependency_resolve module=resolver status=error key={} dependency={} released={} error={}",
                    descriptor.key(),
                    dependency.describe(),
                    burden.len(),
                    err
                );
                release_partial(&burden, context);
                return Err(err);
            }
        }
    }

    Ok((resolved, burden))
}

/// Best-effort release of a partially built burden, newest first.
pub(crate) fn release_partial(burden: &[Burden], context: &mut ResolutionContext) {
    for entry in burden.iter().rev() {
        entry.release(context.events_mut());
    }
}

fn resolve_one(
    descriptor: &ComponentDescriptor,
    dependency: &DependencySpec,
    state: &RegistryState,
    context: &mut ResolutionContext,
    burden: &mut Vec<Burden>,
) -> KernelResult<ResolvedDependency> {
    if let Some(sub_resolver) = state
        .sub_resolvers()
        .iter()
        .find(|sub_resolver| sub_resolver.can_resolve(descriptor, dependency))
    {
        return sub_resolver
            .resolve(descriptor, dependency)
            .map(ResolvedDependency::Single)
            .map_err(|source| KernelError::Factory {
                key: descriptor.key().to_string(),
                source,
            });
    }

    if dependency.collection {
        let members: Vec<Arc<Handler>> = state
            .handlers_for(&dependency.service)
            .into_iter()
            .filter(|handler| handler.is_valid() && !context.on_stack(handler.id()))
            .filter(|handler| {
                dependency
                    .name_hint
                    .as_deref()
                    .map_or(true, |hint| handler.key() == hint)
            })
            .cloned()
            .collect();

        let mut instances = Vec::with_capacity(members.len());
        for handler in members {
            let lease = handler.resolve(state, context)?;
            instances.push(take_lease(lease, &handler, burden));
        }
        return Ok(ResolvedDependency::Many(instances));
    }

    match select(
        state,
        &dependency.service,
        dependency.name_hint.as_deref(),
        context,
    ) {
        Selection::Found(handler) => {
            let lease = handler.resolve(state, context)?;
            Ok(ResolvedDependency::Single(take_lease(lease, &handler, burden)))
        }
        _ if dependency.optional => Ok(ResolvedDependency::Missing),
        Selection::OnStack(handler) => Err(KernelError::CircularDependency {
            path: context.path_to(handler.key()),
        }),
        Selection::NotValid(handler) => Err(handler.not_valid_error()),
        Selection::None => Err(KernelError::NoHandler(dependency.service.clone())),
    }
}

/// Extracts the instance, recording it in `burden` when the caller owns it.
pub(crate) fn take_lease(lease: Lease, handler: &Arc<Handler>, burden: &mut Vec<Burden>) -> Instance {
    let (activation, dependencies, release_required) = lease.into_parts();
    let instance = activation.instance().clone();
    if release_required {
        burden.push(Burden::new(activation, handler.clone(), dependencies));
    }
    instance
}
