//! The machine context primitive (component A of the design): allocates a
//! stack, builds an executable context on it, and transfers control between
//! contexts. No heap allocation happens on the hot path of a switch; the
//! only allocation is the one `mmap` per fiber when its stack is created.
//!
//! Everything above this module (fiber control blocks, ready/sleep queues,
//! the dispatcher) is built in terms of [`Fiber::switch`] and never touches
//! a register directly.

#![allow(unreachable_pub)]

use std::mem::ManuallyDrop;

use crate::import_sysdeps;
use crate::os::mman::{Builder, Map};
use crate::os::resource::stack_limit;
use crate::pointer::{MutPtr, Ptr};

import_sysdeps!();

pub mod control;
pub use control::{FiberControl, Kind};

macro_rules! define_context {
	(pub struct $name:ident $($rest:tt)*) => {
		#[repr(C)]
		pub struct $name $($rest)*

		impl Default for $name {
			fn default() -> Self {
				/* Safety: repr(C), all-zero is a valid bit pattern for a context
				 * that has never been switched to */
				unsafe { std::mem::zeroed() }
			}
		}
	};
}

use define_context;

/// The entry point of a freshly created fiber: a function pointer plus its
/// single opaque argument. Written into the top of the fiber's own stack by
/// [`Context::set_start`], so starting a fiber costs no heap allocation.
///
/// # Safety
/// The stack is unused before a fiber is ever switched to, so writing the
/// start arguments there is sound.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Start {
	start: unsafe fn(Ptr<()>),
	arg: Ptr<()>
}

impl Start {
	/// # Safety
	/// `start` must never unwind, and must not return — it must exit the
	/// fiber (see [`Fiber::exit`]) instead of falling off the end.
	#[must_use]
	pub const unsafe fn new(start: unsafe fn(Ptr<()>), arg: Ptr<()>) -> Self {
		Self { start, arg }
	}
}

/// Written to the stack of the *suspended* fiber so that when it is next
/// resumed, it runs `intercept` instead of returning from the `switch` call
/// that suspended it. Used exactly once, to destroy a fiber from whichever
/// fiber resumes it (see [`Fiber::exit`]): the destruction cannot happen on
/// the exiting fiber's own stack, so the exiting fiber rewrites its
/// resumer's continuation to run the destructor on the resumer's behalf
/// before the resumer notices anything happened.
#[repr(C)]
#[derive(Clone, Copy)]
struct Intercept {
	intercept: unsafe fn(Ptr<()>),
	arg: Ptr<()>,
	ret: Ptr<()>
}

/// # Safety
/// `arg` must point to a `ManuallyDrop<Fiber>` that has just been switched
/// away from and is safe to drop (i.e. nothing else still references its
/// stack).
unsafe fn exit_fiber(arg: Ptr<()>) {
	/* Safety: guaranteed by caller */
	let fiber = unsafe { arg.cast::<ManuallyDrop<Fiber>>().cast_mut().as_mut() };

	/* Safety: we are running on a different stack than the one being dropped */
	drop(unsafe { ManuallyDrop::take(fiber) });
}

/// A fiber's machine context and the stack it runs on.
///
/// `Fiber::main()` produces a stub with no owned stack, representing the OS
/// thread's native stack (invariant 1 in the data model: switching *to* the
/// main fiber always resumes the OS thread, never a mapped stack).
#[repr(C)]
pub struct Fiber {
	context: Context,
	stack: Map
}

impl Fiber {
	#[must_use]
	pub fn main() -> Self {
		Self { context: Context::default(), stack: Map::empty() }
	}

	/// # Errors
	/// if the stack allocator fails to map a new stack.
	pub fn try_new() -> crate::error::Result<Self> {
		Self::try_new_with_stack_size(stack_limit()?)
	}

	/// Like [`Fiber::try_new`], but with an explicit stack size instead of
	/// the platform default (`RLIMIT_STACK`).
	///
	/// # Errors
	/// if the stack allocator fails to map a new stack.
	pub fn try_new_with_stack_size(stack_size: usize) -> crate::error::Result<Self> {
		let stack = Builder::new(stack_size).map()?;

		Ok(Self { context: Context::default(), stack })
	}

	/// # Panics
	/// if the stack allocator fails. Most callers go through
	/// [`crate::fiber::control::FiberControl::worker`] instead, which
	/// surfaces the failure as a [`crate::error::Error`].
	#[must_use]
	pub fn new() -> Self {
		#[allow(clippy::expect_used)]
		Self::try_new().expect("failed to allocate stack for fiber")
	}

	#[must_use]
	pub fn new_with_start(start: Start) -> Self {
		let mut this = Self::new();

		/* Safety: the fiber was never started */
		unsafe { this.set_start(start) };

		this
	}

	/// Sets (or resets) the entry point of the fiber.
	///
	/// # Safety
	/// The fiber must not currently be running.
	pub unsafe fn set_start(&mut self, start: Start) {
		/* Safety: the fiber isn't running, so its stack isn't in use */
		unsafe {
			self.context
				.set_stack(self.stack.addr().cast_const().cast(), self.stack.len());
			self.context.set_start(start);
		}
	}

	/// Switches from the currently running fiber `this` to `to`.
	///
	/// # Safety
	/// `this` must be the fiber currently executing on this OS thread, and
	/// `to` must be a fiber started (or main/dispatcher) on the same
	/// thread, not already running.
	pub unsafe fn switch(this: MutPtr<Self>, to: MutPtr<Self>) {
		/* Safety: guaranteed by caller */
		unsafe { crate::assert_unsafe_precondition!(!this.is_null() && !to.is_null()) };

		/* Safety: guaranteed by caller. All registers are declared clobbered in
		 * the arch-specific `switch`; it's cheaper to let the compiler save only
		 * what it knows is live than to save every callee-saved register on every
		 * switch. */
		unsafe { platform::switch(&mut this.as_mut().context, &mut to.as_mut().context) };
	}

	/// Releases the physical pages backing the stack without unmapping it,
	/// so the virtual address range can be reused if this `Fiber` is kept
	/// around (e.g. in a pool).
	///
	/// # Safety
	/// The fiber must not be running.
	pub unsafe fn clear_stack(&mut self) {
		self.stack.advise_free();
	}

	/// Switches to `to`, then drops `self`. Because `self` cannot destroy
	/// itself from its own stack, this writes an [`Intercept`] onto `to`'s
	/// continuation: the *next* time `to` is resumed, it runs [`exit_fiber`]
	/// instead of returning normally, dropping `self` from `to`'s stack
	/// before `to`'s own caller notices the detour.
	///
	/// # Safety
	/// Same as [`Fiber::switch`]; additionally `self` must be finished
	/// executing (its user function has returned).
	pub unsafe fn exit(self, to: MutPtr<Self>) -> ! {
		/* Safety: guaranteed by caller */
		unsafe { crate::assert_unsafe_precondition!(!to.is_null()) };

		let mut fiber = ManuallyDrop::new(self);
		let ptr = MutPtr::from(&mut fiber);

		/* Safety: contract upheld by caller */
		unsafe {
			let to_ref = to.as_mut();

			to_ref.context.set_intercept(Intercept {
				intercept: exit_fiber,
				arg: ptr.cast_const().cast(),
				ret: to_ref.context.program_counter()
			});

			Self::switch(ptr.cast(), to);

			crate::opt::hint::unreachable_unchecked()
		}
	}
}

impl Default for Fiber {
	fn default() -> Self {
		Self::new()
	}
}

/* Safety: a `Fiber` owns its stack outright; it is never aliased across
 * threads since only one OS thread ever runs it */
unsafe impl Send for Fiber {}

#[cfg(test)]
mod tests {
	use super::*;

	fn start(arg: Ptr<()>) {
		/* Safety: test sets this up as &mut (Fiber, Fiber, i32) */
		let mut data = unsafe { arg.cast::<(Fiber, Fiber, i32)>().cast_mut() };
		let mut val = 0;

		loop {
			/* Safety: see above */
			unsafe { data.as_mut().2 += val };
			val += 1;

			/* Safety: both fibers are alive for the duration of the test */
			unsafe { Fiber::switch(MutPtr::from(&mut data.as_mut().1), MutPtr::from(&mut data.as_mut().0)) };
		}
	}

	#[test]
	fn switch_round_trips_and_preserves_state() {
		let mut data = (Fiber::main(), Fiber::new(), 0i32);
		let mut data = MutPtr::from(&mut data);

		/* Safety: single threaded test, data outlives the fibers */
		unsafe {
			data.as_mut().1.set_start(Start::new(start, data.cast_const().cast()));
		}

		let mut expected = 0;

		for i in 0..10 {
			/* Safety: see above */
			unsafe { Fiber::switch(MutPtr::from(&mut data.as_mut().0), MutPtr::from(&mut data.as_mut().1)) };

			expected += i;

			/* Safety: see above */
			assert_eq!(unsafe { data.as_ref().2 }, expected);
		}
	}
}
