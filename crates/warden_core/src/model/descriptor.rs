//! Registration record and component descriptor.
//!
//! # Responsibility
//! - Define the inbound registration record produced by external
//!   descriptor-construction collaborators.
//! - Validate declaration-level invariants before a record reaches the
//!   registry.
//! - Bind a validated record to its activator and optional proxy hook.
//!
//! # Invariants
//! - Keys and identifiers match `IDENTIFIER_RE`.
//! - A descriptor exposes at least one service and no duplicate services.
//! - An empty record key is replaced by a synthetic `<implementation>#<uuid>`.

use crate::model::instance::{ComponentActivator, ProxyFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:<>#\-]*$").expect("valid identifier regex")
});

/// Service identifier (type token) a component satisfies or requires.
pub type ServiceId = String;

/// Unique registration key of one component.
pub type ComponentKey = String;

/// One declared dependency of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Service identifier the dependency requires.
    pub service: ServiceId,
    /// Exact component key to use instead of policy-based selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_hint: Option<ComponentKey>,
    /// When true, absence never blocks resolution.
    #[serde(default)]
    pub optional: bool,
    /// When true, receives every valid implementation (possibly none).
    #[serde(default)]
    pub collection: bool,
}

impl DependencySpec {
    /// Mandatory single-instance dependency.
    pub fn required(service: impl Into<ServiceId>) -> Self {
        Self {
            service: service.into(),
            name_hint: None,
            optional: false,
            collection: false,
        }
    }

    /// Dependency that resolves to `Missing` when unsatisfiable.
    pub fn optional(service: impl Into<ServiceId>) -> Self {
        Self {
            optional: true,
            ..Self::required(service)
        }
    }

    /// Dependency on every valid implementation of `service`.
    pub fn collection(service: impl Into<ServiceId>) -> Self {
        Self {
            collection: true,
            ..Self::required(service)
        }
    }

    /// Pins the dependency to the component registered under `key`.
    pub fn named(mut self, key: impl Into<ComponentKey>) -> Self {
        self.name_hint = Some(key.into());
        self
    }

    /// Returns whether this dependency participates in handler validity.
    pub fn blocks_validity(&self) -> bool {
        !self.optional && !self.collection
    }

    /// Short label used in diagnostics, e.g. `repo` or `repo@sql_repo`.
    pub fn describe(&self) -> String {
        match self.name_hint.as_deref() {
            Some(hint) => format!("{}@{hint}", self.service),
            None => self.service.clone(),
        }
    }
}

/// Scope source for the scoped lifestyle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// One instance per OS thread.
    Thread,
    /// One instance per explicit scope begun on the resolving thread.
    Explicit,
}

/// Behavior of a pooled lifestyle when every slot is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail immediately with `PoolExhausted`.
    Fail,
    /// Wait for a released instance, failing after `timeout_ms`.
    Block { timeout_ms: u64 },
}

/// Creation/caching policy declared by a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Lifestyle {
    Transient,
    Singleton,
    Scoped {
        scope: ScopeKind,
    },
    Pooled {
        max_size: usize,
        on_exhausted: ExhaustionPolicy,
    },
}

impl Default for Lifestyle {
    fn default() -> Self {
        Self::Singleton
    }
}

impl Lifestyle {
    /// Stable label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Singleton => "singleton",
            Self::Scoped {
                scope: ScopeKind::Thread,
            } => "per_thread",
            Self::Scoped {
                scope: ScopeKind::Explicit,
            } => "scoped",
            Self::Pooled { .. } => "pooled",
        }
    }
}

/// Inbound registration record.
///
/// Plain data: the kernel never inspects the implementation behind
/// `implementation`, it only carries the identifier for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Unique key; empty asks the kernel for a synthetic key.
    #[serde(default)]
    pub key: ComponentKey,
    pub services: Vec<ServiceId>,
    pub implementation: String,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub lifestyle: Lifestyle,
    /// Opaque values for collaborators layered on top of the kernel.
    #[serde(default)]
    pub extended_properties: BTreeMap<String, Value>,
}

impl RegistrationRecord {
    /// Starts a singleton record exposing `key` as its only service.
    pub fn new(key: impl Into<ComponentKey>, implementation: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            services: vec![key.clone()],
            key,
            implementation: implementation.into(),
            dependencies: Vec::new(),
            lifestyle: Lifestyle::default(),
            extended_properties: BTreeMap::new(),
        }
    }

    /// Replaces the exposed services.
    pub fn services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn lifestyle(mut self, lifestyle: Lifestyle) -> Self {
        self.lifestyle = lifestyle;
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extended_properties.insert(name.into(), value);
        self
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if !self.key.is_empty() && !is_valid_identifier(&self.key) {
            return Err(RecordValidationError::InvalidKey(self.key.clone()));
        }
        if !is_valid_identifier(&self.implementation) {
            return Err(RecordValidationError::InvalidIdentifier(
                self.implementation.clone(),
            ));
        }
        if self.services.is_empty() {
            return Err(RecordValidationError::NoServices);
        }

        let mut seen = BTreeSet::new();
        for service in &self.services {
            if !is_valid_identifier(service) {
                return Err(RecordValidationError::InvalidIdentifier(service.clone()));
            }
            if !seen.insert(service.as_str()) {
                return Err(RecordValidationError::DuplicateService(service.clone()));
            }
        }

        for dependency in &self.dependencies {
            if !is_valid_identifier(&dependency.service) {
                return Err(RecordValidationError::InvalidIdentifier(
                    dependency.service.clone(),
                ));
            }
            if let Some(hint) = dependency.name_hint.as_deref() {
                if !is_valid_identifier(hint) {
                    return Err(RecordValidationError::InvalidKey(hint.to_string()));
                }
            }
        }

        if let Lifestyle::Pooled { max_size: 0, .. } = self.lifestyle {
            return Err(RecordValidationError::EmptyPool);
        }

        Ok(())
    }
}

fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_RE.is_match(value)
}

/// Registration record validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    InvalidKey(String),
    InvalidIdentifier(String),
    NoServices,
    DuplicateService(String),
    EmptyPool,
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey(value) => write!(f, "component key is invalid: `{value}`"),
            Self::InvalidIdentifier(value) => write!(f, "identifier is invalid: `{value}`"),
            Self::NoServices => write!(f, "component must expose at least one service"),
            Self::DuplicateService(value) => write!(f, "service declared twice: `{value}`"),
            Self::EmptyPool => write!(f, "pooled lifestyle requires max_size >= 1"),
        }
    }
}

impl Error for RecordValidationError {}

/// Immutable runtime description of one registered component.
pub struct ComponentDescriptor {
    key: ComponentKey,
    services: Vec<ServiceId>,
    implementation: String,
    dependencies: Vec<DependencySpec>,
    lifestyle: Lifestyle,
    extended_properties: BTreeMap<String, Value>,
    activator: Arc<dyn ComponentActivator>,
    proxy: Option<Arc<dyn ProxyFactory>>,
}

impl ComponentDescriptor {
    /// Validates `record` and binds it to `activator`.
    pub fn new(
        record: RegistrationRecord,
        activator: impl ComponentActivator + 'static,
    ) -> Result<Self, RecordValidationError> {
        Self::with_shared_activator(record, Arc::new(activator))
    }

    pub fn with_shared_activator(
        record: RegistrationRecord,
        activator: Arc<dyn ComponentActivator>,
    ) -> Result<Self, RecordValidationError> {
        record.validate()?;
        let key = if record.key.is_empty() {
            format!("{}#{}", record.implementation, Uuid::new_v4().simple())
        } else {
            record.key
        };

        Ok(Self {
            key,
            services: record.services,
            implementation: record.implementation,
            dependencies: record.dependencies,
            lifestyle: record.lifestyle,
            extended_properties: record.extended_properties,
            activator,
            proxy: None,
        })
    }

    /// Declares that every instance must pass through `proxy` before use.
    pub fn with_proxy(mut self, proxy: Arc<dyn ProxyFactory>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn services(&self) -> &[ServiceId] {
        &self.services
    }

    pub fn provides(&self, service: &str) -> bool {
        self.services.iter().any(|value| value == service)
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn dependencies(&self) -> &[DependencySpec] {
        &self.dependencies
    }

    pub fn lifestyle(&self) -> Lifestyle {
        self.lifestyle
    }

    pub fn extended_properties(&self) -> &BTreeMap<String, Value> {
        &self.extended_properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.extended_properties.get(name)
    }

    pub fn activator(&self) -> &Arc<dyn ComponentActivator> {
        &self.activator
    }

    pub fn proxy(&self) -> Option<&Arc<dyn ProxyFactory>> {
        self.proxy.as_ref()
    }

    /// Returns whether a dependency of this component targets `other`.
    pub(crate) fn depends_on(&self, other: &ComponentDescriptor) -> bool {
        self.dependencies.iter().any(|dependency| match &dependency.name_hint {
            Some(hint) => hint == other.key(),
            None => other.provides(&dependency.service),
        })
    }
}

impl Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("key", &self.key)
            .field("services", &self.services)
            .field("implementation", &self.implementation)
            .field("dependencies", &self.dependencies)
            .field("lifestyle", &self.lifestyle)
            .field("proxied", &self.proxy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ComponentDescriptor, DependencySpec, ExhaustionPolicy, Lifestyle, RecordValidationError,
        RegistrationRecord,
    };
    use crate::model::instance::FnActivator;
    use std::sync::Arc;

    fn unit_activator() -> FnActivator {
        FnActivator::new(|_| Ok(Arc::new(())))
    }

    #[test]
    fn rejects_invalid_key_and_duplicate_services() {
        let err = RegistrationRecord::new("bad key", "Impl")
            .validate()
            .expect_err("whitespace in key must be rejected");
        assert_eq!(err, RecordValidationError::InvalidKey("bad key".to_string()));

        let err = RegistrationRecord::new("logger", "ConsoleLogger")
            .services(["logger", "logger"])
            .validate()
            .expect_err("duplicate services must be rejected");
        assert!(matches!(err, RecordValidationError::DuplicateService(_)));
    }

    #[test]
    fn rejects_empty_pool() {
        let err = RegistrationRecord::new("conn", "Connection")
            .lifestyle(Lifestyle::Pooled {
                max_size: 0,
                on_exhausted: ExhaustionPolicy::Fail,
            })
            .validate()
            .expect_err("zero-sized pool must be rejected");
        assert_eq!(err, RecordValidationError::EmptyPool);
    }

    #[test]
    fn empty_key_gets_synthetic_key() {
        let mut record = RegistrationRecord::new("", "ConsoleLogger");
        record.services = vec!["logger".to_string()];
        let descriptor =
            ComponentDescriptor::new(record, unit_activator()).expect("valid record");

        assert!(descriptor.key().starts_with("ConsoleLogger#"));
        assert!(descriptor.provides("logger"));
    }

    #[test]
    fn record_deserializes_with_defaults() {
        let record: RegistrationRecord = serde_json::from_str(
            r#"{
                "key": "service",
                "services": ["service"],
                "implementation": "OrderService",
                "dependencies": [{ "service": "repo", "name_hint": "sql_repo" }],
                "lifestyle": { "kind": "pooled", "max_size": 4, "on_exhausted": { "block": { "timeout_ms": 50 } } },
                "extended_properties": { "interceptors": ["audit"] }
            }"#,
        )
        .expect("record json");

        assert_eq!(
            record.lifestyle,
            Lifestyle::Pooled {
                max_size: 4,
                on_exhausted: ExhaustionPolicy::Block { timeout_ms: 50 },
            }
        );
        assert_eq!(
            record.dependencies[0],
            DependencySpec::required("repo").named("sql_repo")
        );
        assert!(!record.dependencies[0].optional);
        assert!(record.extended_properties.contains_key("interceptors"));

        let minimal: RegistrationRecord = serde_json::from_str(
            r#"{ "services": ["clock"], "implementation": "SystemClock" }"#,
        )
        .expect("minimal record json");
        assert_eq!(minimal.lifestyle, Lifestyle::Singleton);
        assert!(minimal.key.is_empty());
    }

    #[test]
    fn depends_on_respects_name_hint() {
        let repo = ComponentDescriptor::new(
            RegistrationRecord::new("sql_repo", "SqlRepo").services(["repo"]),
            unit_activator(),
        )
        .expect("repo descriptor");
        let pinned_elsewhere = ComponentDescriptor::new(
            RegistrationRecord::new("service", "Service")
                .depends_on(DependencySpec::required("repo").named("mem_repo")),
            unit_activator(),
        )
        .expect("service descriptor");
        let any_repo = ComponentDescriptor::new(
            RegistrationRecord::new("reporting", "Reporting")
                .depends_on(DependencySpec::required("repo")),
            unit_activator(),
        )
        .expect("reporting descriptor");

        assert!(!pinned_elsewhere.depends_on(&repo));
        assert!(any_repo.depends_on(&repo));
    }
}
