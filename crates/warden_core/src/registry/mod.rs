//! Component registry: registration, resolution entry points and teardown.
//!
//! # Responsibility
//! - Own the handler arena and keep handler validity current under dynamic
//!   registration and unregistration.
//! - Serve `resolve`/`resolve_all` and track the burdens callers must release.
//! - Publish lifecycle events and manage explicit scopes.
//!
//! # Invariants
//! - Keys are unique among live handlers.
//! - Resolution holds the reader lock for the whole call chain; structural
//!   changes take the writer lock.
//! - The lock is fair: a queued writer blocks new outermost resolutions.
//!   Only resolutions nested inside an activator on the same thread re-enter
//!   the reader lock past a queued writer.
//! - Activator destroy hooks and event listeners never run under the writer
//!   lock.
//! - After `dispose`, every mutating or resolving call fails with `Disposed`.
//!
//! # See also
//! - `state` for validity propagation.
//! - `crate::resolver` for dependency selection.

pub mod events;
pub(crate) mod state;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::handler::{Handler, HandlerState};
use crate::model::descriptor::{ComponentDescriptor, Lifestyle, RegistrationRecord, ServiceId};
use crate::model::instance::{ComponentActivator, ExternalInstance, Instance, InstanceId};
use crate::release::ReleasePolicy;
use crate::resolver::{self, ResolutionContext, Selection, SubDependencyResolver};
use crate::scope::{ScopeGuard, ScopeKey};
use events::{EventHub, KernelEvent, SubscriptionId};
use log::{debug, info, warn};
use parking_lot::{RwLock, RwLockReadGuard};
use state::{RegistryState, StateChange};
use std::any::Any;
use std::cell::RefCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static READING: RefCell<Vec<RegistryId>> = const { RefCell::new(Vec::new()) };
}

/// Process-unique identity of one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryId(u64);

impl RegistryId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a handler keeps of the registry that owns it.
#[derive(Clone)]
pub(crate) struct RegistryLink {
    pub(crate) id: RegistryId,
    pub(crate) events: Weak<EventHub>,
}

impl RegistryLink {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            id: RegistryId::next(),
            events: Weak::new(),
        }
    }
}

/// Reader guard that records the registry as being read on this thread.
struct StateReader<'r> {
    state: RwLockReadGuard<'r, RegistryState>,
    registry: RegistryId,
}

impl Deref for StateReader<'_> {
    type Target = RegistryState;

    fn deref(&self) -> &RegistryState {
        &self.state
    }
}

impl Drop for StateReader<'_> {
    fn drop(&mut self) {
        let _ = READING.try_with(|reading| {
            let mut reading = reading.borrow_mut();
            if let Some(index) = reading.iter().rposition(|id| *id == self.registry) {
                reading.remove(index);
            }
        });
    }
}

/// Arena of handlers plus the service index.
pub struct Registry {
    id: RegistryId,
    config: KernelConfig,
    state: RwLock<RegistryState>,
    release_policy: ReleasePolicy,
    events: Arc<EventHub>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let id = RegistryId::next();
        debug!(
            "event=registry_open module=registry status=ok registry={} selection={}",
            id.0,
            config.selection.as_str()
        );
        Self {
            id,
            state: RwLock::new(RegistryState::new(config.selection)),
            config,
            release_policy: ReleasePolicy::new(),
            events: Arc::new(EventHub::default()),
        }
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Takes the reader lock.
    ///
    /// The outermost read on a thread queues behind waiting writers. A read
    /// nested in one already held on this thread (an activator resolving its
    /// own dependencies) re-enters, since waiting would deadlock.
    fn read_state(&self) -> StateReader<'_> {
        let nested = READING
            .try_with(|reading| {
                let mut reading = reading.borrow_mut();
                let nested = reading.contains(&self.id);
                reading.push(self.id);
                nested
            })
            .unwrap_or(true);
        let state = if nested {
            self.state.read_recursive()
        } else {
            self.state.read()
        };
        StateReader {
            state,
            registry: self.id,
        }
    }

    fn link(&self) -> RegistryLink {
        RegistryLink {
            id: self.id,
            events: Arc::downgrade(&self.events),
        }
    }

    /// Registers a descriptor and re-validates everything depending on it.
    ///
    /// # Errors
    /// - `DuplicateKey` when the key is already registered.
    /// - `Disposed` after `dispose`.
    pub fn register(&self, descriptor: ComponentDescriptor) -> KernelResult<Arc<Handler>> {
        let mut events = Vec::new();
        let handler = {
            let mut state = self.state.write();
            self.insert_locked(&mut state, descriptor, &mut events)?
        };
        self.events.dispatch(events);
        Ok(handler)
    }

    /// Builds a descriptor from `record` and registers it.
    pub fn register_record(
        &self,
        record: RegistrationRecord,
        activator: impl ComponentActivator + 'static,
    ) -> KernelResult<Arc<Handler>> {
        self.register(ComponentDescriptor::new(record, activator)?)
    }

    /// Registers an instance created outside the kernel as a singleton.
    ///
    /// The kernel never destroys the instance; `release` of it is a no-op.
    pub fn register_instance<I, S>(
        &self,
        key: &str,
        services: I,
        instance: Instance,
    ) -> KernelResult<Arc<Handler>>
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        let record = RegistrationRecord::new(key, "external")
            .services(services)
            .lifestyle(Lifestyle::Singleton);
        let descriptor = ComponentDescriptor::new(record, ExternalInstance(instance))?;

        let mut events = Vec::new();
        let handler = {
            let mut state = self.state.write();
            let handler = self.insert_locked(&mut state, descriptor, &mut events)?;
            // Fill the singleton cache now; the handler has no dependencies.
            let mut context = ResolutionContext::new();
            handler.resolve(&state, &mut context)?;
            events.append(&mut context.take_events());
            handler
        };
        self.events.dispatch(events);
        Ok(handler)
    }

    fn insert_locked(
        &self,
        state: &mut RegistryState,
        descriptor: ComponentDescriptor,
        events: &mut Vec<KernelEvent>,
    ) -> KernelResult<Arc<Handler>> {
        if state.disposed {
            return Err(KernelError::Disposed);
        }
        if state.contains_key(descriptor.key()) {
            warn!(
                "event=component_register module=registry status=error key={} error=duplicate_key",
                descriptor.key()
            );
            return Err(KernelError::DuplicateKey(descriptor.key().to_string()));
        }

        let handler = Arc::new(Handler::new(state.next_id(), Arc::new(descriptor), &self.link()));
        state.insert(handler.clone());
        let changes = state.recompute(vec![handler.id()]);
        info!(
            "event=component_register module=registry status=ok key={} services={} lifestyle={} state={} changed={}",
            handler.key(),
            handler.descriptor().services().join(","),
            handler.descriptor().lifestyle().label(),
            handler.state(),
            changes.len()
        );
        collect_state_events(changes, events);
        Ok(handler)
    }

    /// Removes a component, disposes what its lifestyle owns and
    /// re-validates its dependents.
    pub fn unregister(&self, key: &str) -> KernelResult<()> {
        let mut events = Vec::new();
        let removed = {
            let mut state = self.state.write();
            if state.disposed {
                return Err(KernelError::Disposed);
            }
            let Some(removed) = state.remove(key) else {
                warn!(
                    "event=component_unregister module=registry status=error key={} error=not_found",
                    key
                );
                return Err(KernelError::NotFound(key.to_string()));
            };
            let seeds = state.dependents_of(removed.descriptor());
            let changes = state.recompute(seeds);
            info!(
                "event=component_unregister module=registry status=ok key={} changed={}",
                key,
                changes.len()
            );
            collect_state_events(changes, &mut events);
            removed
        };

        removed.dispose(&mut events);
        self.events.dispatch(events);
        Ok(())
    }

    /// Installs a sub-resolver and re-validates every handler.
    pub fn add_sub_resolver(&self, sub_resolver: Arc<dyn SubDependencyResolver>) -> KernelResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            if state.disposed {
                return Err(KernelError::Disposed);
            }
            state.add_sub_resolver(sub_resolver);
            let seeds = state.all_ids();
            let changes = state.recompute(seeds);
            info!(
                "event=sub_resolver_add module=registry status=ok total={} changed={}",
                state.sub_resolvers().len(),
                changes.len()
            );
            collect_state_events(changes, &mut events);
        }
        self.events.dispatch(events);
        Ok(())
    }

    /// Resolves one instance of `service`.
    ///
    /// With `name_hint`, only the handler registered under that key is
    /// considered. Instances that need caller-driven release are tracked
    /// until `release`.
    ///
    /// # Errors
    /// - `NoHandler` when nothing provides `service`.
    /// - `HandlerNotValid` when providers exist but all are waiting.
    /// - `CircularDependency`, `Factory`, `PoolExhausted`, `ScopeNotActive`
    ///   from the dependency chain.
    pub fn resolve(&self, service: &str, name_hint: Option<&str>) -> KernelResult<Instance> {
        let mut context = ResolutionContext::new();
        let result = {
            let state = self.read_state();
            if state.disposed {
                return Err(KernelError::Disposed);
            }
            self.resolve_root(&state, service, name_hint, &mut context)
        };
        if let Err(err) = &result {
            debug!(
                "event=component_resolve module=registry status=error service={} error={}",
                service, err
            );
        }
        self.events.dispatch(context.take_events());
        result
    }

    /// Typed `resolve` for the most preferred handler of `service`.
    pub fn resolve_as<T: Any + Send + Sync>(&self, service: &str) -> KernelResult<Arc<T>> {
        let instance = self.resolve(service, None)?;
        instance.downcast::<T>().map_err(|instance| {
            self.release(&instance);
            KernelError::TypeMismatch {
                service: service.to_string(),
                expected: std::any::type_name::<T>(),
            }
        })
    }

    /// Resolves every valid handler of `service` in registration order.
    pub fn resolve_all(&self, service: &str) -> KernelResult<Vec<Instance>> {
        let mut context = ResolutionContext::new();
        let mut roots = Vec::new();
        let result = {
            let state = self.read_state();
            if state.disposed {
                return Err(KernelError::Disposed);
            }
            let mut instances = Vec::new();
            let mut failure = None;
            for handler in state.handlers_for(service).into_iter().filter(|h| h.is_valid()) {
                match handler.resolve(&state, &mut context) {
                    Ok(lease) => instances.push(resolver::take_lease(lease, handler, &mut roots)),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            match failure {
                Some(err) => {
                    resolver::release_partial(&roots, &mut context);
                    roots.clear();
                    Err(err)
                }
                None => Ok(instances),
            }
        };
        for burden in roots {
            self.release_policy.track(burden);
        }
        self.events.dispatch(context.take_events());
        result
    }

    fn resolve_root(
        &self,
        state: &RegistryState,
        service: &str,
        name_hint: Option<&str>,
        context: &mut ResolutionContext,
    ) -> KernelResult<Instance> {
        let handler = match resolver::select(state, service, name_hint, context) {
            Selection::Found(handler) => handler,
            Selection::NotValid(handler) => return Err(handler.not_valid_error()),
            Selection::OnStack(handler) => {
                return Err(KernelError::CircularDependency {
                    path: vec![handler.key().to_string()],
                })
            }
            Selection::None => return Err(KernelError::NoHandler(service.to_string())),
        };

        let lease = handler.resolve(state, context)?;
        let mut roots = Vec::with_capacity(1);
        let instance = resolver::take_lease(lease, &handler, &mut roots);
        for burden in roots {
            self.release_policy.track(burden);
        }
        Ok(instance)
    }

    /// Releases a tracked instance and cascades through its burden.
    ///
    /// Returns `false` for untracked instances (singleton, scoped, external
    /// or already released).
    pub fn release<T: ?Sized>(&self, instance: &Arc<T>) -> bool {
        let id = InstanceId::of(instance);
        let mut events = Vec::new();
        let released = self.release_policy.release(id, &mut events);
        self.events.dispatch(events);
        released
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&KernelEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Begins an explicit scope on the current thread.
    pub fn begin_scope(&self) -> ScopeGuard<'_> {
        ScopeGuard::begin(self)
    }

    /// Destroys every scoped instance created within `scope`.
    pub fn end_scope(&self, scope: ScopeKey) {
        let handlers: Vec<Arc<Handler>> = {
            let state = self.read_state();
            state.handlers().rev().cloned().collect()
        };
        let mut events = Vec::new();
        for handler in &handlers {
            handler.lifestyle().end_scope(scope, &mut events);
        }
        debug!(
            "event=scope_end module=registry status=ok scope={} destroyed={}",
            scope,
            events.len()
        );
        self.events.dispatch(events);
    }

    /// Ends the implicit scope bound to the calling thread.
    pub fn end_thread_scope(&self) {
        self.end_scope(ScopeKey::current_thread());
    }

    pub fn handler(&self, key: &str) -> Option<Arc<Handler>> {
        self.read_state().handler(key).cloned()
    }

    pub fn handler_state(&self, key: &str) -> Option<HandlerState> {
        self.read_state().handler(key).map(|handler| handler.state())
    }

    /// Handlers exposing `service`, in registration order.
    pub fn handlers_for(&self, service: &str) -> Vec<Arc<Handler>> {
        self.read_state()
            .handlers_for(service)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of root instances awaiting `release`.
    pub fn tracked_count(&self) -> usize {
        self.release_policy.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.read_state().disposed
    }

    /// Releases tracked burdens, then disposes handlers newest first.
    ///
    /// Idempotent.
    pub fn dispose(&self) {
        let handlers = {
            let mut state = self.state.write();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.drain_newest_first()
        };

        info!(
            "event=registry_dispose module=registry status=start registry={} handlers={}",
            self.id.0,
            handlers.len()
        );
        let mut events = Vec::new();
        let released = self.release_policy.release_all(&mut events);
        for handler in &handlers {
            handler.dispose(&mut events);
        }
        info!(
            "event=registry_dispose module=registry status=ok registry={} released={} destroyed={}",
            self.id.0,
            released,
            events.len()
        );
        self.events.dispatch(events);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn collect_state_events(changes: Vec<StateChange>, events: &mut Vec<KernelEvent>) {
    for change in changes {
        let state = change.handler.state();
        info!(
            "event=handler_state module=registry status=ok key={} from={} to={}",
            change.handler.key(),
            change.previous,
            state
        );
        events.push(KernelEvent::HandlerStateChanged {
            descriptor: change.handler.descriptor().clone(),
            state,
        });
    }
}
