//! Execution-time enforcement.
//!
//! ## Components
//!
//! - [`guard_daemon`]: deadline queue and the watchdog thread that terminates
//!   runtimes whose guarded execution overran
//!
//! ## Usage
//!
//! ```rust,ignore
//! let guard = runtime.guard(Duration::from_millis(50))?;
//! match runtime.execute(source) {
//!     Err(e) if e.is_terminated() => assert!(guard.was_triggered()),
//!     other => other?,
//! };
//! ```

mod guard_daemon;

pub use guard_daemon::{ExecutionTarget, Guard, GuardDaemon};
