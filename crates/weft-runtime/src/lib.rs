//! Weft Fiber Runtime
//!
//! Cooperative, stackful coroutines ("fibers") on a single OS thread:
//! - **Fibers**: units of execution that suspend mid-call-stack and resume
//!   exactly where they stopped (`fiber` module)
//! - **Root runtime**: the owning thread's scheduling context, with an
//!   ordered registry of managed fibers (`runtime` module)
//! - **Await protocol**: `join`/`join_all` drive target fibers to completion
//!   through direct hand-off (`join` module)
//!
//! Concurrency here means interleaving via explicit control transfer, never
//! parallelism: no two contexts ever execute simultaneously, and the only
//! suspension points are `yield_now`, `yield_until`, and the end of a task.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_runtime::{Fiber, Runtime};
//!
//! let rt = Runtime::init()?;
//!
//! let worker = Fiber::spawn(|| {
//!     for step in 0..3 {
//!         println!("step {}", step);
//!         weft_runtime::yield_now();
//!     }
//! })?;
//!
//! rt.schedule(worker);
//! while rt.tick() > 0 {}
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod context;

/// Fiber handles and the execution-context state machine
pub mod fiber;

/// Await protocol: block cooperatively until target fibers terminate
pub mod join;

/// Runtime lifecycle and the root scheduling loop
pub mod runtime;

pub use fiber::{yield_now, yield_until, Fiber, FiberId, ResetError, SpawnError, Status};
pub use join::{join, join_all};
pub use runtime::{InitError, Runtime, RuntimeConfig};
