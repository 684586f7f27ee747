//! Runtime failure kinds.
//!
//! Per the design notes, almost everything the core detects is a programming
//! error (double-linking, joining self, a scheduler mismatch, a custom
//! dispatcher that refuses to run the workers it was handed, ...); those are
//! asserted and abort the process (`panic_nounwind!`) rather than being
//! represented here, since by the time they're detected there is no caller
//! left to hand a `Result` to (they surface during `Scheduler`/`Registry`
//! teardown, not from a function a caller invoked directly). The only
//! recoverable failure is one that originates outside the core entirely: the
//! stack allocator running out of resources.

use crate::os::OsError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The stack allocator failed to produce a stack for a new fiber.
	#[error("failed to allocate fiber stack: {0}")]
	StackAllocation(#[from] OsError)
}
