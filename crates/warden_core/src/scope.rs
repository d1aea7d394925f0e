//! Scope keys and explicit scope guards.
//!
//! # Responsibility
//! - Mint opaque scope keys for per-thread and explicit scopes.
//! - Track the explicit scopes active on the current thread, per registry.
//! - End the implicit per-thread scope when its thread exits.
//!
//! # Invariants
//! - Scope keys are never reused within a process.
//! - The innermost active explicit scope wins for resolution.
//! - Ending a scope (guard drop or `end`) disposes instances created in it.

use crate::registry::{Registry, RegistryId};
use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCOPE_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SCOPE: ThreadScope = ThreadScope {
        key: ScopeKey::next(),
        exit_hooks: RefCell::new(Vec::new()),
    };
    static ACTIVE_SCOPES: RefCell<Vec<(RegistryId, ScopeKey)>> = const { RefCell::new(Vec::new()) };
}

/// Opaque key identifying one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(u64);

impl ScopeKey {
    fn next() -> Self {
        Self(NEXT_SCOPE_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// Key of the implicit scope bound to the calling thread.
    ///
    /// While the thread is being torn down this is a fresh key each call.
    pub fn current_thread() -> Self {
        THREAD_SCOPE
            .try_with(|scope| scope.key)
            .unwrap_or_else(|_| Self::next())
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

type ExitHook = Box<dyn FnOnce(ScopeKey)>;

/// Implicit scope of one thread; its exit hooks run when the thread ends.
struct ThreadScope {
    key: ScopeKey,
    exit_hooks: RefCell<Vec<(u64, ExitHook)>>,
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        for (_, hook) in self.exit_hooks.get_mut().drain(..).rev() {
            hook(self.key);
        }
    }
}

/// Runs `hook` with the thread scope key when the calling thread exits.
///
/// At most one hook per `owner` is kept on a thread.
pub(crate) fn on_thread_exit(owner: u64, hook: impl FnOnce(ScopeKey) + 'static) {
    let _ = THREAD_SCOPE.try_with(|scope| {
        let mut hooks = scope.exit_hooks.borrow_mut();
        if hooks.iter().all(|(registered, _)| *registered != owner) {
            hooks.push((owner, Box::new(hook)));
        }
    });
}

/// Innermost explicit scope begun for `registry` on this thread.
pub(crate) fn current_explicit(registry: RegistryId) -> Option<ScopeKey> {
    ACTIVE_SCOPES.with(|scopes| {
        scopes
            .borrow()
            .iter()
            .rev()
            .find(|(owner, _)| *owner == registry)
            .map(|(_, key)| *key)
    })
}

fn push_active(registry: RegistryId) -> ScopeKey {
    let key = ScopeKey::next();
    ACTIVE_SCOPES.with(|scopes| scopes.borrow_mut().push((registry, key)));
    key
}

fn remove_active(registry: RegistryId, key: ScopeKey) {
    ACTIVE_SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        if let Some(index) = scopes
            .iter()
            .rposition(|(owner, active)| *owner == registry && *active == key)
        {
            scopes.remove(index);
        }
    });
}

/// Explicit scope bound to the current thread until dropped.
///
/// Not `Send`: the scope is tracked in thread-local state.
pub struct ScopeGuard<'r> {
    registry: &'r Registry,
    key: ScopeKey,
    ended: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<'r> ScopeGuard<'r> {
    pub(crate) fn begin(registry: &'r Registry) -> Self {
        let key = push_active(registry.id());
        Self {
            registry,
            key,
            ended: false,
            _not_send: std::marker::PhantomData,
        }
    }

    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// Ends the scope now, disposing its instances.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        remove_active(self.registry.id(), self.key);
        self.registry.end_scope(self.key);
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::{on_thread_exit, ScopeKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn thread_scope_key_is_stable_per_thread() {
        let here = ScopeKey::current_thread();
        assert_eq!(here, ScopeKey::current_thread());

        let there = std::thread::spawn(ScopeKey::current_thread)
            .join()
            .expect("thread joins");
        assert_ne!(here, there);
    }

    #[test]
    fn exit_hooks_run_once_per_owner_with_the_thread_key() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let (worker_runs, worker_seen) = (runs.clone(), seen.clone());
        let key = std::thread::spawn(move || {
            for _ in 0..3 {
                let (runs, seen) = (worker_runs.clone(), worker_seen.clone());
                on_thread_exit(7, move |key| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    *seen.lock() = Some(key);
                });
            }
            ScopeKey::current_thread()
        })
        .join()
        .expect("thread joins");

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(key));
    }
}
