//! Await protocol: block cooperatively until target fibers terminate.
//!
//! `join` drives a target fiber's progress with direct resume attempts,
//! bypassing the root's registry entirely: a fiber can push another fiber
//! to completion without the scheduler in between, at the cost of being
//! (cooperatively) blocked for the duration.

use std::thread;
use std::time::Duration;

use crate::context;
use crate::fiber::{Fiber, Status};
use crate::runtime;

/// Used when `join` is driven from a thread whose runtime is already gone.
const FALLBACK_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Block until `fiber` reaches a terminal state.
///
/// If the target is suspended it is resumed directly; while it remains
/// suspended the caller suspends itself (fiber case) or sleeps for the
/// configured idle wait (root case) between retries. A target that returns
/// without yielding is done after a single resume attempt. A terminal target
/// is never resumed.
pub fn join(fiber: &Fiber) {
    if fiber.is_bound() && context::current_id() == Some(fiber.id()) {
        context::die("fiber attempted to join itself");
    }

    if fiber.status() == Status::Suspended {
        fiber.resume();
    }
    while fiber.status() == Status::Suspended {
        wait_for_progress();
        // Re-check after waking: the scheduling pass may have finished the
        // target in the meantime if it is also managed.
        if fiber.status() == Status::Suspended {
            fiber.resume();
        }
    }
}

/// Block until every fiber in `fibers` reaches a terminal state.
///
/// Each pass attempts one condition-gated resume on every still-suspended
/// member; between passes the caller yields or sleeps exactly as [`join`]
/// does. Termination order among the targets is whatever their own resume
/// conditions and suspensions produce.
pub fn join_all<'a, I>(fibers: I)
where
    I: IntoIterator<Item = &'a Fiber>,
{
    let fibers: Vec<&Fiber> = fibers.into_iter().collect();
    for fiber in &fibers {
        if fiber.is_bound() && context::current_id() == Some(fiber.id()) {
            context::die("fiber attempted to join itself");
        }
    }

    loop {
        let mut all_done = true;
        for fiber in &fibers {
            if fiber.status() == Status::Suspended {
                fiber.resume();
                if fiber.status() == Status::Suspended {
                    all_done = false;
                }
            }
        }
        if all_done {
            return;
        }
        wait_for_progress();
    }
}

/// One cooperative wait between retry passes: suspend when called from a
/// fiber, sleep briefly when called from the root.
fn wait_for_progress() {
    if context::in_fiber() {
        context::suspend(None);
    } else {
        thread::sleep(runtime::idle_wait().unwrap_or(FALLBACK_IDLE_WAIT));
    }
}
