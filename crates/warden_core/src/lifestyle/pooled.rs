//! Pooled lifestyle: a bounded set of reusable instances.
//!
//! # Invariants
//! - `idle + in_use + pending <= max_size` at all times.
//! - Release returns an instance to the free list instead of destroying it.
//! - Blocking waits are bounded by the configured timeout.

use super::{Creation, Lease, LifestyleManager};
use crate::error::{KernelError, KernelResult};
use crate::model::descriptor::{ComponentDescriptor, ExhaustionPolicy};
use crate::model::instance::{Activation, InstanceId};
use crate::registry::events::KernelEvent;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct PoolState {
    idle: Vec<Creation>,
    in_use: HashMap<InstanceId, Creation>,
    pending: usize,
    disposed: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }

    fn check_out(&mut self, creation: Creation) -> Lease {
        let activation = creation.activation().clone();
        self.in_use.insert(activation.id(), creation);
        Lease::borrowed(activation)
    }
}

pub struct PooledLifestyle {
    descriptor: Arc<ComponentDescriptor>,
    max_size: usize,
    on_exhausted: ExhaustionPolicy,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl PooledLifestyle {
    pub(crate) fn new(
        descriptor: Arc<ComponentDescriptor>,
        max_size: usize,
        on_exhausted: ExhaustionPolicy,
    ) -> Self {
        Self {
            descriptor,
            max_size,
            on_exhausted,
            state: Mutex::new(PoolState::default()),
            returned: Condvar::new(),
        }
    }

    /// Instances currently idle in the free list.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn exhausted(&self) -> KernelError {
        warn!(
            "event=pool_exhausted module=lifestyle status=error key={} max_size={}",
            self.descriptor.key(),
            self.max_size
        );
        KernelError::PoolExhausted {
            key: self.descriptor.key().to_string(),
            max_size: self.max_size,
        }
    }
}

impl LifestyleManager for PooledLifestyle {
    fn resolve(&self, create: &mut dyn FnMut() -> KernelResult<Creation>) -> KernelResult<Lease> {
        let deadline = match self.on_exhausted {
            ExhaustionPolicy::Fail => None,
            ExhaustionPolicy::Block { timeout_ms } => {
                Some(Instant::now() + Duration::from_millis(timeout_ms))
            }
        };

        let mut state = self.state.lock();
        loop {
            if let Some(creation) = state.idle.pop() {
                return Ok(state.check_out(creation));
            }

            if state.occupied() < self.max_size {
                state.pending += 1;
                let created = MutexGuard::unlocked(&mut state, || create());
                state.pending -= 1;
                return match created {
                    Ok(creation) => {
                        debug!(
                            "event=pool_grow module=lifestyle status=ok key={} size={}",
                            self.descriptor.key(),
                            state.occupied() + 1
                        );
                        Ok(state.check_out(creation))
                    }
                    Err(err) => {
                        self.returned.notify_one();
                        Err(err)
                    }
                };
            }

            let Some(deadline) = deadline else {
                return Err(self.exhausted());
            };
            if Instant::now() >= deadline {
                return Err(self.exhausted());
            }
            self.returned.wait_until(&mut state, deadline);
        }
    }

    fn release(&self, activation: &Activation, events: &mut Vec<KernelEvent>) -> bool {
        let mut state = self.state.lock();
        let Some(creation) = state.in_use.remove(&activation.id()) else {
            return false;
        };

        if state.disposed {
            drop(state);
            creation.destroy(&self.descriptor, events);
        } else {
            state.idle.push(creation);
            drop(state);
            self.returned.notify_one();
        }
        true
    }

    fn dispose(&self, events: &mut Vec<KernelEvent>) {
        let idle = {
            let mut state = self.state.lock();
            state.disposed = true;
            std::mem::take(&mut state.idle)
        };
        for creation in idle.iter().rev() {
            creation.destroy(&self.descriptor, events);
        }
        self.returned.notify_all();
    }

    fn live_count(&self) -> usize {
        let state = self.state.lock();
        state.idle.len() + state.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::PooledLifestyle;
    use crate::error::KernelError;
    use crate::lifestyle::test_support::{counting_descriptor, fresh_creation};
    use crate::lifestyle::LifestyleManager;
    use crate::model::descriptor::{ExhaustionPolicy, Lifestyle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn pool(max_size: usize, on_exhausted: ExhaustionPolicy) -> (PooledLifestyle, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let lifestyle = Lifestyle::Pooled {
            max_size,
            on_exhausted,
        };
        (
            PooledLifestyle::new(
                counting_descriptor(lifestyle, destroyed.clone()),
                max_size,
                on_exhausted,
            ),
            destroyed,
        )
    }

    #[test]
    fn reuses_released_instances() {
        let (pool, destroyed) = pool(2, ExhaustionPolicy::Fail);
        let mut events = Vec::new();

        let first = pool
            .resolve(&mut || Ok(fresh_creation()))
            .expect("first checkout");
        assert!(first.release_required());
        assert!(pool.release(first.activation(), &mut events));
        assert_eq!(pool.idle_count(), 1);

        let again = pool
            .resolve(&mut || panic!("idle instance must be reused"))
            .expect("reuse checkout");
        assert_eq!(first.activation().id(), again.activation().id());
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert!(events.is_empty());
    }

    #[test]
    fn fails_fast_when_exhausted() {
        let (pool, _) = pool(1, ExhaustionPolicy::Fail);
        let _held = pool
            .resolve(&mut || Ok(fresh_creation()))
            .expect("only slot");

        let err = pool
            .resolve(&mut || Ok(fresh_creation()))
            .expect_err("pool is full");
        assert!(matches!(err, KernelError::PoolExhausted { max_size: 1, .. }));
    }

    #[test]
    fn blocking_checkout_times_out() {
        let (pool, _) = pool(1, ExhaustionPolicy::Block { timeout_ms: 30 });
        let _held = pool
            .resolve(&mut || Ok(fresh_creation()))
            .expect("only slot");

        let started = Instant::now();
        let err = pool
            .resolve(&mut || Ok(fresh_creation()))
            .expect_err("blocked checkout times out");
        assert!(matches!(err, KernelError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocking_checkout_wakes_on_release() {
        let (pool, _) = pool(1, ExhaustionPolicy::Block { timeout_ms: 5_000 });
        let pool = Arc::new(pool);
        let held = pool
            .resolve(&mut || Ok(fresh_creation()))
            .expect("only slot");
        let held_id = held.activation().id();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                pool.resolve(&mut || Ok(fresh_creation()))
                    .expect("checkout after release")
                    .activation()
                    .id()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let mut events = Vec::new();
        assert!(pool.release(held.activation(), &mut events));
        assert_eq!(waiter.join().expect("waiter joins"), held_id);
    }

    #[test]
    fn dispose_destroys_idle_and_late_returns() {
        let (pool, destroyed) = pool(2, ExhaustionPolicy::Fail);
        let mut events = Vec::new();
        let a = pool.resolve(&mut || Ok(fresh_creation())).expect("a");
        let b = pool.resolve(&mut || Ok(fresh_creation())).expect("b");
        assert!(pool.release(a.activation(), &mut events));

        pool.dispose(&mut events);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        assert!(pool.release(b.activation(), &mut events));
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.live_count(), 0);
    }
}
