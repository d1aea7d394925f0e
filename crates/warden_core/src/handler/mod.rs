//! Per-component handler and its validity state machine.
//!
//! # Responsibility
//! - Own one descriptor and the lifestyle manager built for it.
//! - Expose the `WaitingDependency`/`Valid` state and the dependencies that
//!   keep a handler waiting.
//! - Run the creation routine: resolve dependencies, activate, wrap, announce.
//!
//! # Invariants
//! - A handler is always in exactly one state.
//! - State only changes while the registry writer lock is held, so resolves
//!   in flight observe a stable snapshot.
//! - A waiting handler never reaches its lifestyle manager.

use crate::error::{KernelError, KernelResult};
use crate::lifestyle::{self, Creation, Lease, LifestyleManager};
use crate::model::descriptor::ComponentDescriptor;
use crate::model::instance::Activation;
use crate::registry::events::KernelEvent;
use crate::registry::state::RegistryState;
use crate::registry::RegistryLink;
use crate::resolver::{self, ResolutionContext};
use log::{debug, error};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Monotonic handler id; ascending ids follow registration order.
pub type HandlerId = usize;

/// Validity state of one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    /// At least one required dependency is unregistered or itself waiting.
    WaitingDependency,
    /// Every required dependency is currently satisfiable.
    Valid,
}

impl HandlerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingDependency => "waiting_dependency",
            Self::Valid => "valid",
        }
    }
}

impl Display for HandlerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StateSnapshot {
    state: HandlerState,
    missing: Vec<String>,
}

/// Runtime wrapper around one registered component.
pub struct Handler {
    id: HandlerId,
    descriptor: Arc<ComponentDescriptor>,
    lifestyle: Box<dyn LifestyleManager>,
    snapshot: RwLock<StateSnapshot>,
}

impl Handler {
    pub(crate) fn new(
        id: HandlerId,
        descriptor: Arc<ComponentDescriptor>,
        owner: &RegistryLink,
    ) -> Self {
        let lifestyle = lifestyle::manager_for(&descriptor, owner);
        let missing = descriptor
            .dependencies()
            .iter()
            .filter(|dependency| dependency.blocks_validity())
            .map(|dependency| dependency.describe())
            .collect();
        Self {
            id,
            descriptor,
            lifestyle,
            snapshot: RwLock::new(StateSnapshot {
                state: HandlerState::WaitingDependency,
                missing,
            }),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn key(&self) -> &str {
        self.descriptor.key()
    }

    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        &self.descriptor
    }

    pub fn lifestyle(&self) -> &dyn LifestyleManager {
        self.lifestyle.as_ref()
    }

    pub fn state(&self) -> HandlerState {
        self.snapshot.read().state
    }

    pub fn is_valid(&self) -> bool {
        self.state() == HandlerState::Valid
    }

    /// Required dependencies currently keeping this handler waiting.
    pub fn missing_dependencies(&self) -> Vec<String> {
        self.snapshot.read().missing.clone()
    }

    pub(crate) fn set_state(&self, state: HandlerState, missing: Vec<String>) {
        let mut snapshot = self.snapshot.write();
        snapshot.state = state;
        snapshot.missing = missing;
    }

    pub(crate) fn not_valid_error(&self) -> KernelError {
        KernelError::HandlerNotValid {
            key: self.key().to_string(),
            missing: self.missing_dependencies(),
        }
    }

    /// Produces or fetches an instance through the lifestyle manager.
    pub(crate) fn resolve(
        &self,
        state: &RegistryState,
        context: &mut ResolutionContext,
    ) -> KernelResult<Lease> {
        if !self.is_valid() {
            return Err(self.not_valid_error());
        }

        context.enter(self.id, self.key());
        let result = self
            .lifestyle
            .resolve(&mut || self.create(state, context));
        context.leave();
        result
    }

    fn create(&self, state: &RegistryState, context: &mut ResolutionContext) -> KernelResult<Creation> {
        let (dependencies, burden) =
            resolver::resolve_dependencies(&self.descriptor, state, context)?;

        let raw = match self.descriptor.activator().create(&dependencies) {
            Ok(raw) => raw,
            Err(err) => {
                error!(
                    "event=instance_create module=handler status=error key={} error={}",
                    self.key(),
                    err
                );
                resolver::release_partial(&burden, context);
                return Err(KernelError::Factory {
                    key: self.key().to_string(),
                    source: err,
                });
            }
        };

        let activation = match self.descriptor.proxy() {
            None => Activation::new(raw),
            Some(proxy) => match proxy.wrap(raw.clone(), &self.descriptor) {
                Ok(wrapped) => Activation::wrapped(raw, wrapped),
                Err(err) => {
                    error!(
                        "event=instance_wrap module=handler status=error key={} error={}",
                        self.key(),
                        err
                    );
                    self.descriptor.activator().destroy(&raw);
                    resolver::release_partial(&burden, context);
                    return Err(KernelError::Factory {
                        key: self.key().to_string(),
                        source: err,
                    });
                }
            },
        };

        debug!(
            "event=instance_create module=handler status=ok key={} lifestyle={} instance={} dependencies={}",
            self.key(),
            self.descriptor.lifestyle().label(),
            activation.id(),
            burden.len()
        );
        context.push_event(KernelEvent::InstanceCreated {
            descriptor: self.descriptor.clone(),
            instance: activation.instance().clone(),
        });
        Ok(Creation::new(activation, burden))
    }

    /// Disposes every instance owned by the lifestyle manager.
    pub(crate) fn dispose(&self, events: &mut Vec<KernelEvent>) {
        self.lifestyle.dispose(events);
    }
}

impl Debug for Handler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}
