//! Native stack-switch seam and the per-thread "current fiber" slot.
//!
//! Everything platform-specific about saving and restoring a call stack is
//! delegated to `corosensei`, which implements the create/resume/suspend
//! capability per target. The rest of the crate talks to this module in
//! terms of [`SwitchRequest`] (what a suspending fiber hands to its
//! resumer) and [`TaskOutcome`] (what a finishing fiber hands back).

use std::any::Any;
use std::cell::Cell;

use corosensei::stack::DefaultStack;
use corosensei::{ScopedCoroutine, Yielder};

use crate::fiber::FiberId;

/// What a fiber's task body produced: normal return, or the captured panic
/// payload. Crosses the final stack switch as a value, never as an unwind.
pub(crate) type TaskOutcome = Result<(), Box<dyn Any + Send>>;

/// Predicate gating whether a future resume attempt performs a stack switch.
pub(crate) type ResumeCondition = Box<dyn FnMut() -> bool>;

/// Carried from a suspending fiber to whoever resumed it: the condition
/// under which the fiber wants to be resumed next. `None` means the very
/// next attempt succeeds.
pub(crate) struct SwitchRequest {
    pub(crate) condition: Option<ResumeCondition>,
}

/// The native stackful coroutine underneath one fiber.
pub(crate) type NativeContext =
    ScopedCoroutine<'static, (), SwitchRequest, TaskOutcome, DefaultStack>;

/// Identity of the fiber whose stack is executing right now, plus the
/// suspension point back into its resumer.
#[derive(Clone, Copy)]
pub(crate) struct CurrentFrame {
    id: FiberId,
    yielder: *const Yielder<(), SwitchRequest>,
}

thread_local! {
    /// At most one context is current per thread; `None` means the root.
    static CURRENT: Cell<Option<CurrentFrame>> = const { Cell::new(None) };
}

/// Id of the currently-executing fiber, or `None` when the root is running.
pub(crate) fn current_id() -> Option<FiberId> {
    CURRENT.with(|c| c.get().map(|frame| frame.id))
}

/// Whether a fiber (as opposed to the root) is executing.
pub(crate) fn in_fiber() -> bool {
    CURRENT.with(|c| c.get().is_some())
}

/// Publish `id` as the current fiber. Called on the fiber's own stack when
/// its task body first starts.
pub(crate) fn enter(id: FiberId, yielder: &Yielder<(), SwitchRequest>) {
    CURRENT.with(|c| c.set(Some(CurrentFrame { id, yielder })));
}

/// Take the current frame prior to switching into another context. The
/// resumer holds the returned frame across the switch and puts it back with
/// [`restore`] once control comes home.
pub(crate) fn save() -> Option<CurrentFrame> {
    CURRENT.with(|c| c.take())
}

/// Reinstate the frame saved by [`save`].
pub(crate) fn restore(frame: Option<CurrentFrame>) {
    CURRENT.with(|c| c.set(frame));
}

/// Suspend the currently-executing fiber, handing `condition` to its
/// resumer. Returns once some later resume attempt switches back in.
pub(crate) fn suspend(condition: Option<ResumeCondition>) {
    let frame = CURRENT
        .with(|c| c.get())
        .unwrap_or_else(|| die("suspend outside of a fiber"));
    // SAFETY: the yielder lives on the resumer side of this fiber's native
    // coroutine and stays valid until the task body returns; this fiber is
    // suspended, not destroyed, for the whole time the pointer is parked in
    // the thread-local slot.
    let yielder = unsafe { &*frame.yielder };
    yielder.suspend(SwitchRequest { condition });
    // Back on this fiber's stack: the resumer cleared the slot when control
    // left it, so republish.
    CURRENT.with(|c| c.set(Some(frame)));
}

/// Fatal contract violation: the switching discipline is (or is about to
/// be) corrupted, so unwinding is not an option.
pub(crate) fn die(message: &str) -> ! {
    log::error!("{}, aborting", message);
    eprintln!("{}, aborting", message);
    std::process::abort();
}
