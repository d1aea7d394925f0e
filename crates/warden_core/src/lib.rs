//! Component resolution and lifecycle kernel.
//!
//! Turns registered component descriptors into live instances, resolves
//! their dependency graphs under dynamic registration, applies lifestyle
//! policy and releases owned instances deterministically.

pub mod config;
pub mod error;
pub mod handler;
pub mod lifestyle;
pub mod logging;
pub mod model;
pub mod registry;
pub mod release;
pub mod resolver;
pub mod scope;

pub use config::{ConfigError, KernelConfig, LoggingConfig, SelectionPolicy};
pub use error::{KernelError, KernelResult};
pub use handler::{Handler, HandlerId, HandlerState};
pub use lifestyle::LifestyleManager;
pub use logging::{default_log_level, init_logging, logging_status, LogTarget};
pub use model::descriptor::{
    ComponentDescriptor, ComponentKey, DependencySpec, ExhaustionPolicy, Lifestyle,
    RecordValidationError, RegistrationRecord, ScopeKind, ServiceId,
};
pub use model::instance::{
    instance, Activation, ActivationError, ComponentActivator, FnActivator, Instance, InstanceId,
    ProxyFactory, ResolvedDependencies, ResolvedDependency,
};
pub use registry::events::{KernelEvent, SubscriptionId};
pub use registry::{Registry, RegistryId};
pub use resolver::SubDependencyResolver;
pub use scope::{ScopeGuard, ScopeKey};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
