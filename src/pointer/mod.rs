//! Raw pointer wrappers used by the scheduler's intrusive data structures.
//!
//! `FiberControl` blocks are embedded inside the stacks they manage, and the
//! scheduler keeps non-owning back references to fibers it doesn't yet have
//! the right to borrow (the active fiber, the joiner's target, ...). `Ptr`
//! and `MutPtr` exist so those references read like pointers (no borrow
//! checker fighting across a context switch) while still being `Copy`,
//! nullable by default, and one `as_ref`/`as_mut` away from a real reference
//! when the caller has established it's safe.

mod internal;
mod ptr;

pub use internal::AsPointer;
pub use ptr::*;
