//! Type-erased instances and the activation contracts around them.
//!
//! # Responsibility
//! - Define the instance handle vended by the kernel and its identity.
//! - Define the activator (instance factory callback) and proxy-wrap hook
//!   contracts implemented by external collaborators.
//! - Present already-resolved dependencies to activators.
//!
//! # Invariants
//! - Instance identity is the address of the shared allocation; it is stable
//!   while any clone of the handle is alive.
//! - The kernel never reflects over instances; activators own construction
//!   and teardown details.

use crate::model::descriptor::{ComponentDescriptor, DependencySpec};
use std::any::{type_name, Any};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Shared, type-erased component instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Wraps a concrete value into an [`Instance`].
pub fn instance<T: Any + Send + Sync>(value: T) -> Instance {
    Arc::new(value)
}

/// Identity of one vended instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

impl InstanceId {
    /// Identity of the allocation behind `instance`, typed or erased.
    pub fn of<T: ?Sized>(instance: &Arc<T>) -> Self {
        Self(Arc::as_ptr(instance) as *const () as usize)
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One produced instance: what callers receive and what the activator built.
///
/// `raw` and `vended` are the same handle unless a proxy hook wrapped it.
#[derive(Clone)]
pub struct Activation {
    vended: Instance,
    raw: Instance,
}

impl Activation {
    pub(crate) fn new(raw: Instance) -> Self {
        Self {
            vended: raw.clone(),
            raw,
        }
    }

    pub(crate) fn wrapped(raw: Instance, vended: Instance) -> Self {
        Self { vended, raw }
    }

    /// Handle returned to callers.
    pub fn instance(&self) -> &Instance {
        &self.vended
    }

    /// Handle produced by the activator, before any proxy wrapping.
    pub fn raw(&self) -> &Instance {
        &self.raw
    }

    pub fn id(&self) -> InstanceId {
        InstanceId::of(&self.vended)
    }
}

impl Debug for Activation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("vended", &InstanceId::of(&self.vended))
            .field("raw", &InstanceId::of(&self.raw))
            .finish()
    }
}

/// Failure raised by an activator or proxy hook.
#[derive(Debug, Clone)]
pub struct ActivationError {
    message: String,
    cause: Option<Arc<dyn Error + Send + Sync>>,
}

impl ActivationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Wraps an arbitrary error, keeping it reachable through `source()`.
    pub fn caused_by(err: impl Error + Send + Sync + 'static) -> Self {
        Self {
            message: err.to_string(),
            cause: Some(Arc::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ActivationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ActivationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self.cause.as_deref() {
            Some(cause) => Some(cause),
            None => None,
        }
    }
}

/// Instance factory callback supplied by whoever knows the implementation.
pub trait ComponentActivator: Send + Sync {
    /// Produces a new instance from already-resolved dependency values.
    fn create(&self, dependencies: &ResolvedDependencies) -> Result<Instance, ActivationError>;

    /// Disposal hook invoked with the raw instance when its owner releases it.
    fn destroy(&self, _instance: &Instance) {}

    /// Whether the kernel owns the instances this activator hands out.
    ///
    /// When `false`, teardown neither calls `destroy` nor reports
    /// `InstanceDestroyed`.
    fn owns_instances(&self) -> bool {
        true
    }
}

type CreateFn = dyn Fn(&ResolvedDependencies) -> Result<Instance, ActivationError> + Send + Sync;
type DestroyFn = dyn Fn(&Instance) + Send + Sync;

/// Closure-backed [`ComponentActivator`].
pub struct FnActivator {
    create: Box<CreateFn>,
    destroy: Option<Box<DestroyFn>>,
}

impl FnActivator {
    pub fn new<F>(create: F) -> Self
    where
        F: Fn(&ResolvedDependencies) -> Result<Instance, ActivationError> + Send + Sync + 'static,
    {
        Self {
            create: Box::new(create),
            destroy: None,
        }
    }

    pub fn on_destroy<F>(mut self, destroy: F) -> Self
    where
        F: Fn(&Instance) + Send + Sync + 'static,
    {
        self.destroy = Some(Box::new(destroy));
        self
    }
}

impl ComponentActivator for FnActivator {
    fn create(&self, dependencies: &ResolvedDependencies) -> Result<Instance, ActivationError> {
        (self.create)(dependencies)
    }

    fn destroy(&self, instance: &Instance) {
        if let Some(destroy) = &self.destroy {
            destroy(instance);
        }
    }
}

/// Activator for an instance created outside the kernel.
///
/// The kernel does not own the instance, so `destroy` is a no-op.
pub(crate) struct ExternalInstance(pub(crate) Instance);

impl ComponentActivator for ExternalInstance {
    fn create(&self, _dependencies: &ResolvedDependencies) -> Result<Instance, ActivationError> {
        Ok(self.0.clone())
    }

    fn owns_instances(&self) -> bool {
        false
    }
}

/// Proxy-wrapping hook; the only integration point with interception.
pub trait ProxyFactory: Send + Sync {
    fn wrap(
        &self,
        raw: Instance,
        descriptor: &ComponentDescriptor,
    ) -> Result<Instance, ActivationError>;
}

impl<F> ProxyFactory for F
where
    F: Fn(Instance, &ComponentDescriptor) -> Result<Instance, ActivationError> + Send + Sync,
{
    fn wrap(
        &self,
        raw: Instance,
        descriptor: &ComponentDescriptor,
    ) -> Result<Instance, ActivationError> {
        self(raw, descriptor)
    }
}

/// Value produced for one dependency.
#[derive(Clone)]
pub enum ResolvedDependency {
    Single(Instance),
    Many(Vec<Instance>),
    /// Optional dependency with no provider; the activator applies its default.
    Missing,
}

impl Debug for ResolvedDependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(instance) => write!(f, "Single({})", InstanceId::of(instance)),
            Self::Many(instances) => write!(f, "Many(len={})", instances.len()),
            Self::Missing => write!(f, "Missing"),
        }
    }
}

/// Dependency values in declaration order, handed to activators.
#[derive(Debug, Clone, Default)]
pub struct ResolvedDependencies {
    entries: Vec<(DependencySpec, ResolvedDependency)>,
}

impl ResolvedDependencies {
    pub(crate) fn push(&mut self, spec: DependencySpec, value: ResolvedDependency) {
        self.entries.push((spec, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DependencySpec, &ResolvedDependency)> {
        self.entries.iter().map(|(spec, value)| (spec, value))
    }

    pub fn at(&self, index: usize) -> Option<&ResolvedDependency> {
        self.entries.get(index).map(|(_, value)| value)
    }

    /// First value declared for `service`.
    pub fn get(&self, service: &str) -> Option<&ResolvedDependency> {
        self.entries
            .iter()
            .find(|(spec, _)| spec.service == service)
            .map(|(_, value)| value)
    }

    /// Typed single instance for `service`; `None` when missing or mistyped.
    pub fn single<T: Any + Send + Sync>(&self, service: &str) -> Option<Arc<T>> {
        match self.get(service)? {
            ResolvedDependency::Single(instance) => instance.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Typed single instance for `service`, failing activation otherwise.
    pub fn required<T: Any + Send + Sync>(&self, service: &str) -> Result<Arc<T>, ActivationError> {
        self.single::<T>(service).ok_or_else(|| {
            ActivationError::new(format!(
                "dependency `{service}` is not a resolved `{}`",
                type_name::<T>()
            ))
        })
    }

    /// Every collection member for `service` that downcasts to `T`.
    pub fn collection<T: Any + Send + Sync>(&self, service: &str) -> Vec<Arc<T>> {
        match self.get(service) {
            Some(ResolvedDependency::Many(instances)) => instances
                .iter()
                .filter_map(|instance| instance.clone().downcast::<T>().ok())
                .collect(),
            Some(ResolvedDependency::Single(instance)) => {
                instance.clone().downcast::<T>().ok().into_iter().collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{instance, InstanceId, ResolvedDependencies, ResolvedDependency};
    use crate::model::descriptor::DependencySpec;
    use std::sync::Arc;

    #[test]
    fn instance_id_matches_typed_and_erased_handles() {
        let typed = Arc::new(7_u32);
        let erased: super::Instance = typed.clone();
        assert_eq!(InstanceId::of(&typed), InstanceId::of(&erased));

        let other = instance(7_u32);
        assert_ne!(InstanceId::of(&erased), InstanceId::of(&other));
    }

    #[test]
    fn typed_access_by_service() {
        let mut deps = ResolvedDependencies::default();
        deps.push(
            DependencySpec::required("name"),
            ResolvedDependency::Single(instance("warden".to_string())),
        );
        deps.push(
            DependencySpec::collection("port"),
            ResolvedDependency::Many(vec![instance(80_u16), instance(443_u16)]),
        );
        deps.push(DependencySpec::optional("clock"), ResolvedDependency::Missing);

        assert_eq!(deps.len(), 3);
        assert_eq!(
            deps.required::<String>("name").expect("name").as_str(),
            "warden"
        );
        assert!(deps.single::<u32>("name").is_none());
        assert_eq!(deps.collection::<u16>("port").len(), 2);
        assert!(matches!(deps.get("clock"), Some(ResolvedDependency::Missing)));
        assert!(deps.required::<u64>("clock").is_err());
    }
}
