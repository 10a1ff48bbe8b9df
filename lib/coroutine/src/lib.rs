//! Stackful coroutines for I/O-bound work driven by an event loop.
//!
//! A [`Coroutine`] runs on its own stack and can [`yield_now`] back to
//! whoever entered it. Entering is depth-first: coroutines woken while another
//! one runs are entered as soon as it yields or returns, ahead of anything
//! that was already waiting. Terminated coroutines hand their stacks back to
//! the [`CoroutinePool`] they came from.
//!
//! ```
//! use std::{cell::RefCell, rc::Rc};
//!
//! use hostkit_coroutine::{CoroutineEngine, yield_now};
//!
//! let engine = CoroutineEngine::new("main-loop");
//! let steps = Rc::new(RefCell::new(Vec::new()));
//!
//! let log = steps.clone();
//! let co = engine
//!     .spawn(move || {
//!         log.borrow_mut().push("started");
//!         yield_now();
//!         log.borrow_mut().push("resumed");
//!     })
//!     .unwrap();
//!
//! engine.enter(&co);
//! assert_eq!(*steps.borrow(), ["started"]);
//! engine.enter(&co);
//! assert_eq!(*steps.borrow(), ["started", "resumed"]);
//! assert!(co.is_terminated());
//! ```
//!
//! Protocol violations, such as entering a coroutine that is already running,
//! leave stack state inconsistent and panic instead of returning errors.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::map_unwrap_or,
        clippy::print_stdout,
        clippy::use_self
    )
)]

mod config;
mod context;
mod coroutine;
mod engine;
mod error;
mod pool;

pub use crate::config::EngineConfig;
pub use crate::context::ExecutionContext;
pub use crate::coroutine::{Coroutine, CoroutineId, LockHold};
pub use crate::engine::{
    CoroutineEngine, current, enter, enter_if_inactive, in_coroutine, wake, yield_now,
};
pub use crate::error::CoroutineError;
pub use crate::pool::{CoroutinePool, DEFAULT_POOL_CAPACITY, DEFAULT_STACK_SIZE};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
