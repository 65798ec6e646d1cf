//! Root context: runtime lifecycle and the scheduling loop.
//!
//! Each thread that wants to run fibers first initializes a runtime, which
//! turns the thread itself into the root execution context. The root owns
//! the registry of managed fibers and is the only place that mutates it;
//! one scheduling pass visits the registry in insertion order, attempts a
//! condition-gated resume on every suspended entry, and releases entries
//! that reached a terminal state.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::time::Duration;

use crate::context;
use crate::fiber::{Fiber, Status};

/// Default stack size for fibers spawned without an explicit size (1 MiB).
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Configuration for a thread's fiber runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size in bytes for fibers spawned via [`Fiber::spawn`]
    pub stack_size: usize,

    /// How long the root sleeps between retries when it blocks in
    /// [`join`](crate::join::join)/[`join_all`](crate::join::join_all)
    /// directly, where a fiber would have suspended instead. Keeps a
    /// root-level join from spinning a full core.
    pub idle_wait: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            idle_wait: Duration::from_millis(1),
        }
    }
}

/// Errors that can occur when initializing the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The calling thread already has a live runtime
    #[error("a fiber runtime is already initialized on this thread")]
    AlreadyInitialized,

    /// Initialization was attempted from inside a running fiber
    #[error("cannot initialize a fiber runtime from inside a fiber")]
    InsideFiber,
}

/// Root-side state: the managed registry and the thread's configuration.
struct RootState {
    registry: Vec<Fiber>,
    config: RuntimeConfig,
}

thread_local! {
    static ROOT: RefCell<Option<RootState>> = const { RefCell::new(None) };
}

/// A thread's fiber runtime
///
/// Holding a `Runtime` is proof that the calling thread is the root context.
/// Dropping it is the explicit teardown step: it releases the registry and
/// frees the thread to initialize again later. Teardown aborts if performed
/// from inside a fiber or while a registered fiber is still suspended
/// mid-stack.
pub struct Runtime {
    _thread_bound: PhantomData<*const ()>,
}

impl Runtime {
    /// Initialize the fiber runtime on the calling thread with default
    /// configuration.
    pub fn init() -> Result<Self, InitError> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Initialize the fiber runtime on the calling thread.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, InitError> {
        if context::in_fiber() {
            return Err(InitError::InsideFiber);
        }
        ROOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(InitError::AlreadyInitialized);
            }
            *slot = Some(RootState {
                registry: Vec::new(),
                config,
            });
            Ok(())
        })?;
        log::debug!("fiber runtime initialized");
        Ok(Runtime {
            _thread_bound: PhantomData,
        })
    }

    /// Hand a fiber to the root for scheduling.
    ///
    /// The registry polls fibers in insertion order; that order is
    /// deterministic round-robin, not a priority. The registry keeps the
    /// handle until the fiber reaches a terminal state.
    pub fn schedule(&self, fiber: Fiber) {
        if context::in_fiber() {
            context::die("registry mutated from inside a fiber");
        }
        ROOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            let root = slot.as_mut().expect("no fiber runtime on this thread");
            root.registry.push(fiber);
        });
    }

    /// Run one scheduling pass and return the number of fibers still
    /// registered.
    ///
    /// A pass never blocks: entries whose resume condition is false are
    /// skipped in place, and a pass in which nothing progresses simply
    /// returns.
    pub fn tick(&self) -> usize {
        root_pass()
    }

    /// Drive scheduling passes until `condition` returns true.
    pub fn run_until<F>(&self, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        while !condition() {
            root_pass();
        }
    }

    /// Number of fibers currently registered with the root.
    pub fn fiber_count(&self) -> usize {
        ROOT.with(|slot| {
            slot.borrow()
                .as_ref()
                .map(|root| root.registry.len())
                .unwrap_or(0)
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if context::in_fiber() {
            context::die("fiber runtime torn down from inside a fiber");
        }
        let state = ROOT.with(|slot| slot.borrow_mut().take());
        if let Some(root) = state {
            let live = root
                .registry
                .iter()
                .filter(|fiber| fiber.suspended_mid_stack())
                .count();
            if live > 0 {
                context::die("fiber runtime torn down with fibers suspended mid-stack");
            }
            // Remaining entries never started or already terminated, so
            // releasing them here is safe.
            log::debug!(
                "fiber runtime torn down ({} registered fiber(s) released)",
                root.registry.len()
            );
        }
    }
}

/// Whether the calling thread has a live runtime.
pub(crate) fn is_initialized() -> bool {
    ROOT.with(|slot| slot.borrow().is_some())
}

/// Stack size configured for this thread's runtime, if initialized.
pub(crate) fn default_stack_size() -> Option<usize> {
    ROOT.with(|slot| slot.borrow().as_ref().map(|root| root.config.stack_size))
}

/// Root-side sleep interval for `join`/`join_all`, if initialized.
pub(crate) fn idle_wait() -> Option<Duration> {
    ROOT.with(|slot| slot.borrow().as_ref().map(|root| root.config.idle_wait))
}

/// One scheduling pass over the managed registry.
///
/// Entries are visited by index so no registry borrow is held while a fiber
/// runs. The registry cannot shift underneath the walk: mutating it from
/// inside a fiber is a fatal contract violation.
pub(crate) fn root_pass() -> usize {
    if context::in_fiber() {
        context::die("scheduling pass started from inside a fiber");
    }

    let mut index = 0;
    let mut released = 0;
    loop {
        let entry = ROOT.with(|slot| {
            let slot = slot.borrow();
            let root = slot.as_ref().expect("no fiber runtime on this thread");
            root.registry.get(index).cloned()
        });
        let Some(fiber) = entry else { break };

        if fiber.status() == Status::Suspended {
            fiber.resume();
        }
        if fiber.status() == Status::Suspended {
            index += 1;
        } else {
            // The sole point where a managed fiber's resources are released.
            ROOT.with(|slot| {
                let mut slot = slot.borrow_mut();
                let root = slot.as_mut().expect("no fiber runtime on this thread");
                root.registry.remove(index);
            });
            released += 1;
        }
    }

    if released > 0 {
        log::trace!("scheduling pass released {} fiber(s)", released);
    }
    index
}
