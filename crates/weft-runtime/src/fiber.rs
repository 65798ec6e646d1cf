//! Fiber handles and the execution-context state machine.
//!
//! A fiber wraps one stackful execution context: a task closure bound to its
//! own call stack, a status, and a resume condition. Handles are cheap
//! shared references; the scheduler registry and external observers may hold
//! handles to the same context while it runs.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::CoroutineResult;

use crate::context::{self, NativeContext, ResumeCondition};
use crate::runtime;

/// Unique identifier for a fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Generate a new unique fiber ID
    pub fn new() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable state of a fiber
///
/// A fiber is only ever observed Suspended or terminal: while its own code
/// runs, nothing else on the thread is in a position to look.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Not yet started, or paused at a suspension point
    Suspended,
    /// Task closure returned normally (terminal)
    Finished,
    /// Task closure panicked (terminal)
    Excepted,
}

/// Errors that can occur when binding a task to a fresh fiber
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// No runtime has been initialized on the calling thread
    #[error("no fiber runtime is initialized on this thread")]
    NotInitialized,

    /// The fiber stack could not be allocated
    #[error("failed to allocate a fiber stack: {0}")]
    StackAllocation(#[from] std::io::Error),
}

/// Errors that can occur when resetting a fiber handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResetError {
    /// The fiber has started and is paused mid-stack; releasing it would
    /// tear down live frames
    #[error("cannot reset a fiber that is suspended mid-stack")]
    StillSuspended,
}

/// Shared state of one execution context.
///
/// The native coroutine lives in `native` except while the fiber is the
/// current context: the resumer takes it out for the duration of the switch,
/// which doubles as the running marker.
pub(crate) struct FiberCore {
    id: FiberId,
    status: Cell<Status>,
    started: Cell<bool>,
    native: RefCell<Option<NativeContext>>,
    condition: RefCell<Option<ResumeCondition>>,
    failure: RefCell<Option<Box<dyn Any + Send>>>,
}

impl FiberCore {
    /// Attempt to resume this context. A stored resume condition that
    /// evaluates false makes this a no-op; otherwise exactly one stack
    /// switch happens and, once control returns, the observed result is
    /// folded into `status`.
    pub(crate) fn resume(&self) {
        if context::current_id() == Some(self.id) {
            context::die("fiber attempted to resume itself");
        }
        match self.status.get() {
            Status::Suspended => {}
            status => panic!("resume on a fiber that is already {:?}", status),
        }

        let condition = self.condition.borrow_mut().take();
        if let Some(mut condition) = condition {
            if !condition() {
                *self.condition.borrow_mut() = Some(condition);
                return;
            }
        }

        let mut native = match self.native.borrow_mut().take() {
            Some(native) => native,
            // Only reachable through a resume cycle (A drives B drives A).
            None => context::die("resume of a fiber that is currently running"),
        };
        self.started.set(true);

        let caller = context::save();
        let result = native.resume(());
        context::restore(caller);

        match result {
            CoroutineResult::Yield(request) => {
                *self.condition.borrow_mut() = request.condition;
                *self.native.borrow_mut() = Some(native);
            }
            CoroutineResult::Return(outcome) => match outcome {
                Ok(()) => self.status.set(Status::Finished),
                Err(payload) => {
                    log::warn!(
                        "fiber {:?} failed: {}",
                        self.id,
                        panic_message(payload.as_ref())
                    );
                    *self.failure.borrow_mut() = Some(payload);
                    self.status.set(Status::Excepted);
                }
            },
        }
    }

    pub(crate) fn status(&self) -> Status {
        if context::current_id() == Some(self.id) {
            context::die("fiber queried its own status while running");
        }
        self.status.get()
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    fn suspended_mid_stack(&self) -> bool {
        self.started.get() && self.status.get() == Status::Suspended
    }
}

impl Drop for FiberCore {
    fn drop(&mut self) {
        // A started context still holds live frames; tearing its stack down
        // out from under it is unrecoverable. A never-started context only
        // holds its unrun closure and may be dropped freely.
        if self.suspended_mid_stack() {
            context::die("dropping a fiber that is suspended mid-stack");
        }
    }
}

/// Best-effort text of a captured panic payload, for logging.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// A movable handle to one fiber
///
/// Cloning shares the same underlying execution context, so the scheduler
/// registry and an external `join` caller can both observe it. A default
/// handle is empty and is valid to discard freely.
///
/// Handles are deliberately `!Send`: every operation on a fiber belongs to
/// the thread whose runtime owns it.
#[derive(Clone, Default)]
pub struct Fiber {
    core: Option<Rc<FiberCore>>,
}

impl Fiber {
    /// Bind a task closure to a fresh execution context.
    ///
    /// The stack size comes from the runtime configuration. The task does
    /// not run until the first [`resume`](Self::resume).
    pub fn spawn<F>(task: F) -> Result<Self, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        let stack_size = runtime::default_stack_size().ok_or(SpawnError::NotInitialized)?;
        Self::with_stack_size(stack_size, task)
    }

    /// Bind a task closure to a fresh execution context with an explicit
    /// stack size in bytes.
    pub fn with_stack_size<F>(stack_size: usize, task: F) -> Result<Self, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        if !runtime::is_initialized() {
            return Err(SpawnError::NotInitialized);
        }

        let id = FiberId::new();
        let stack = DefaultStack::new(stack_size)?;
        let native: NativeContext = NativeContext::with_stack(stack, move |yielder, ()| {
            context::enter(id, yielder);
            // The boundary: a panicking task never unwinds across the stack
            // switch. The outcome crosses back to the resumer as a value.
            panic::catch_unwind(AssertUnwindSafe(task))
        });

        log::trace!("spawned fiber {:?} ({} byte stack)", id, stack_size);
        Ok(Fiber {
            core: Some(Rc::new(FiberCore {
                id,
                status: Cell::new(Status::Suspended),
                started: Cell::new(false),
                native: RefCell::new(Some(native)),
                condition: RefCell::new(None),
                failure: RefCell::new(None),
            })),
        })
    }

    /// Bind a task to this handle if it is empty; a bound handle is left
    /// untouched.
    pub fn go<F>(&mut self, task: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + 'static,
    {
        if self.core.is_none() {
            *self = Fiber::spawn(task)?;
        }
        Ok(())
    }

    /// Whether this handle refers to an execution context.
    pub fn is_bound(&self) -> bool {
        self.core.is_some()
    }

    /// Get the fiber's unique ID
    pub fn id(&self) -> FiberId {
        self.require_core("id").id()
    }

    /// Query the fiber's state.
    ///
    /// While Suspended the fiber may be resumed but not released; once
    /// terminal it may be released and never resumed again.
    pub fn status(&self) -> Status {
        self.require_core("status").status()
    }

    /// Attempt to resume the fiber at its last suspension point.
    ///
    /// If the fiber suspended through [`yield_until`] and its condition is
    /// still false, this is a no-op and no stack switch occurs. Panics if
    /// the fiber is unbound or already terminal; a rejected resume is never
    /// reported as success.
    pub fn resume(&self) {
        self.require_core("resume").resume();
    }

    /// Release the handle's context and leave the handle empty.
    ///
    /// Errs if the fiber has started and is still suspended; empty handles,
    /// never-started fibers and terminal fibers reset freely.
    pub fn reset(&mut self) -> Result<(), ResetError> {
        if let Some(core) = &self.core {
            if core.suspended_mid_stack() {
                return Err(ResetError::StillSuspended);
            }
        }
        self.core = None;
        Ok(())
    }

    /// Take the panic payload captured when the task failed.
    ///
    /// Returns `Some` at most once, and only after [`status`](Self::status)
    /// reports [`Status::Excepted`].
    pub fn take_failure(&self) -> Option<Box<dyn Any + Send>> {
        self.require_core("take_failure").failure.borrow_mut().take()
    }

    /// Whether this handle's context has started and is paused mid-stack
    /// (i.e. releasing it now would tear down live frames).
    pub(crate) fn suspended_mid_stack(&self) -> bool {
        self.core
            .as_ref()
            .map(|core| core.suspended_mid_stack())
            .unwrap_or(false)
    }

    fn require_core(&self, operation: &str) -> &Rc<FiberCore> {
        match &self.core {
            Some(core) => core,
            None => panic!("{} on an unbound fiber", operation),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.core {
            Some(core) => f
                .debug_struct("Fiber")
                .field("id", &core.id)
                .field("status", &core.status.get())
                .finish(),
            None => f.write_str("Fiber(unbound)"),
        }
    }
}

/// Suspend the currently-executing fiber unconditionally; the very next
/// resume attempt will switch back in.
///
/// Called from the root, this instead drives one scheduling pass over the
/// managed registry.
pub fn yield_now() {
    if context::in_fiber() {
        context::suspend(None);
    } else {
        runtime::root_pass();
    }
}

/// Suspend the currently-executing fiber until `condition` returns true.
///
/// The condition is stored with the fiber and re-evaluated by whoever next
/// attempts a resume (possibly many times, across many scheduling passes)
/// without the suspended fiber ever being re-entered to poll it.
///
/// Called from the root, this drives scheduling passes until the condition
/// returns true.
pub fn yield_until<F>(mut condition: F)
where
    F: FnMut() -> bool + 'static,
{
    if context::in_fiber() {
        context::suspend(Some(Box::new(condition)));
    } else {
        while !condition() {
            runtime::root_pass();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_spawn_requires_runtime() {
        let result = Fiber::spawn(|| {});
        assert!(matches!(result, Err(SpawnError::NotInitialized)));
    }

    #[test]
    fn test_status_lifecycle() {
        let _rt = Runtime::init().unwrap();

        let fiber = Fiber::spawn(|| {}).unwrap();
        assert_eq!(fiber.status(), Status::Suspended);

        fiber.resume();
        assert_eq!(fiber.status(), Status::Finished);
    }

    #[test]
    fn test_yield_roundtrip_takes_n_plus_one_resumes() {
        let _rt = Runtime::init().unwrap();

        let steps = Rc::new(Cell::new(0u32));
        let fiber = Fiber::spawn({
            let steps = steps.clone();
            move || {
                for _ in 0..3 {
                    steps.set(steps.get() + 1);
                    yield_now();
                }
            }
        })
        .unwrap();

        // Work advances exactly one step per resume, at the prior yield.
        for expected in 1..=3 {
            fiber.resume();
            assert_eq!(steps.get(), expected);
            assert_eq!(fiber.status(), Status::Suspended);
        }

        // Fourth resume runs from the last yield to the end of the task.
        fiber.resume();
        assert_eq!(steps.get(), 3);
        assert_eq!(fiber.status(), Status::Finished);
    }

    #[test]
    fn test_failure_is_captured_not_propagated() {
        let _rt = Runtime::init().unwrap();

        let fiber = Fiber::spawn(|| panic!("task exploded")).unwrap();
        fiber.resume();

        assert_eq!(fiber.status(), Status::Excepted);
        let payload = fiber.take_failure().expect("payload preserved");
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "task exploded");
        assert!(fiber.take_failure().is_none());
    }

    #[test]
    fn test_terminal_status_is_permanent() {
        let _rt = Runtime::init().unwrap();

        let fiber = Fiber::spawn(|| {}).unwrap();
        fiber.resume();
        for _ in 0..3 {
            assert_eq!(fiber.status(), Status::Finished);
        }
    }

    #[test]
    #[should_panic(expected = "resume on a fiber that is already Finished")]
    fn test_resume_after_finish_is_rejected() {
        let _rt = Runtime::init().unwrap();

        let fiber = Fiber::spawn(|| {}).unwrap();
        fiber.resume();
        fiber.resume();
    }

    #[test]
    #[should_panic(expected = "resume on an unbound fiber")]
    fn test_resume_unbound_is_rejected() {
        let fiber = Fiber::default();
        fiber.resume();
    }

    #[test]
    fn test_yield_until_gates_resume_without_reentry() {
        let _rt = Runtime::init().unwrap();

        let gate = Rc::new(Cell::new(false));
        let probes = Rc::new(Cell::new(0u32));
        let steps = Rc::new(Cell::new(0u32));

        let fiber = Fiber::spawn({
            let gate = gate.clone();
            let probes = probes.clone();
            let steps = steps.clone();
            move || {
                steps.set(steps.get() + 1);
                yield_until(move || {
                    probes.set(probes.get() + 1);
                    gate.get()
                });
                steps.set(steps.get() + 1);
            }
        })
        .unwrap();

        fiber.resume();
        assert_eq!(steps.get(), 1);

        // Gated attempts probe the condition but never re-enter the body.
        fiber.resume();
        fiber.resume();
        assert_eq!(probes.get(), 2);
        assert_eq!(steps.get(), 1);
        assert_eq!(fiber.status(), Status::Suspended);

        gate.set(true);
        fiber.resume();
        assert_eq!(probes.get(), 3);
        assert_eq!(steps.get(), 2);
        assert_eq!(fiber.status(), Status::Finished);
    }

    #[test]
    fn test_reset_unstarted_and_terminal() {
        let _rt = Runtime::init().unwrap();

        let mut never_run = Fiber::spawn(|| {}).unwrap();
        assert!(never_run.reset().is_ok());
        assert!(!never_run.is_bound());

        let mut finished = Fiber::spawn(|| {}).unwrap();
        finished.resume();
        assert!(finished.reset().is_ok());

        let mut empty = Fiber::default();
        assert!(empty.reset().is_ok());
    }

    #[test]
    fn test_reset_suspended_mid_stack_fails() {
        let _rt = Runtime::init().unwrap();

        let mut fiber = Fiber::spawn(yield_now).unwrap();
        fiber.resume();
        assert_eq!(fiber.reset(), Err(ResetError::StillSuspended));
        assert!(fiber.is_bound());

        // Drive to completion so the context can be released.
        fiber.resume();
        assert!(fiber.reset().is_ok());
    }

    #[test]
    fn test_go_binds_only_empty_handles() {
        let _rt = Runtime::init().unwrap();

        let flag = Rc::new(Cell::new(false));
        let mut fiber = Fiber::default();
        assert!(!fiber.is_bound());

        fiber
            .go({
                let flag = flag.clone();
                move || flag.set(true)
            })
            .unwrap();
        assert!(fiber.is_bound());

        // Already bound: the second task must be ignored.
        fiber.go(|| panic!("should never be bound")).unwrap();
        fiber.resume();
        assert_eq!(fiber.status(), Status::Finished);
        assert!(flag.get());
    }

    #[test]
    fn test_clone_shares_the_context() {
        let _rt = Runtime::init().unwrap();

        let fiber = Fiber::spawn(yield_now).unwrap();
        let observer = fiber.clone();
        assert_eq!(observer.id(), fiber.id());

        fiber.resume();
        assert_eq!(observer.status(), Status::Suspended);
        fiber.resume();
        assert_eq!(observer.status(), Status::Finished);
    }
}
