//! Kernel lifecycle notifications.
//!
//! # Responsibility
//! - Describe state changes and instance lifecycle transitions.
//! - Fan events out to subscribers in subscription order.
//!
//! # Invariants
//! - Events are dispatched after the registry lock is released, so a
//!   listener may call back into the registry.
//! - A listener added during dispatch only sees later events.

use crate::handler::HandlerState;
use crate::model::descriptor::ComponentDescriptor;
use crate::model::instance::{Instance, InstanceId};
use log::trace;
use parking_lot::RwLock;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Notification emitted by the registry.
#[derive(Clone)]
pub enum KernelEvent {
    HandlerStateChanged {
        descriptor: Arc<ComponentDescriptor>,
        state: HandlerState,
    },
    InstanceCreated {
        descriptor: Arc<ComponentDescriptor>,
        instance: Instance,
    },
    InstanceDestroyed {
        descriptor: Arc<ComponentDescriptor>,
        instance: Instance,
    },
}

impl KernelEvent {
    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        match self {
            Self::HandlerStateChanged { descriptor, .. }
            | Self::InstanceCreated { descriptor, .. }
            | Self::InstanceDestroyed { descriptor, .. } => descriptor,
        }
    }

    pub fn key(&self) -> &str {
        self.descriptor().key()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandlerStateChanged { .. } => "handler_state_changed",
            Self::InstanceCreated { .. } => "instance_created",
            Self::InstanceDestroyed { .. } => "instance_destroyed",
        }
    }
}

impl Debug for KernelEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandlerStateChanged { descriptor, state } => f
                .debug_struct("HandlerStateChanged")
                .field("key", &descriptor.key())
                .field("state", state)
                .finish(),
            Self::InstanceCreated {
                descriptor,
                instance,
            } => f
                .debug_struct("InstanceCreated")
                .field("key", &descriptor.key())
                .field("instance", &InstanceId::of(instance))
                .finish(),
            Self::InstanceDestroyed {
                descriptor,
                instance,
            } => f
                .debug_struct("InstanceDestroyed")
                .field("key", &descriptor.key())
                .field("instance", &InstanceId::of(instance))
                .finish(),
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventHub {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(active, _)| *active != id);
        listeners.len() != before
    }

    pub(crate) fn dispatch(&self, events: Vec<KernelEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for event in &events {
            trace!(
                "event=kernel_event module=registry kind={} key={} listeners={}",
                event.kind(),
                event.key(),
                listeners.len()
            );
            for listener in &listeners {
                listener(event);
            }
        }
    }
}
