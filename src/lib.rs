//! A user-space, single-threaded, stackful fiber scheduler.
//!
//! Fibers are cooperatively scheduled lightweight threads of execution, each
//! with its own stack, running on top of a single OS thread. There is no
//! preemption: a fiber runs until it voluntarily yields, joins another
//! fiber, sleeps, or terminates.
//!
//! The crate is layered, from the bare metal up:
//! - [`fiber`] — the machine-context primitive: stack allocation and raw
//!   context switching ([`fiber::Fiber`]), plus the fiber control block
//!   ([`fiber::control::FiberControl`]) that gives a fiber identity, a
//!   reference count, and the intrusive hooks the scheduler links into its
//!   queues.
//! - [`scheduler`] — the per-thread [`scheduler::Scheduler`] that owns the
//!   ready/sleep/terminate queues and the dispatcher fiber
//!   ([`scheduler::dispatch`]) that is switched to whenever nothing else is
//!   runnable.
//! - [`registry`] — the thread-local handle tying a thread's active fiber,
//!   scheduler, and main-fiber stub together.
//!
//! Everything above those layers — [`spawn`], [`fiber_active`],
//! [`set_custom_dispatcher`] — is the boundary API most callers actually
//! use.

pub mod container;
pub mod error;
pub mod fiber;
pub mod log;
pub mod macros;
pub mod opt;
pub mod os;
pub mod pointer;
pub mod registry;
pub mod runtime;
pub mod scheduler;

pub use error::{Error, Result};
pub use fiber::control::{FiberControl, Kind, Name};
pub use registry::{fiber_active, set_custom_dispatcher};
pub use scheduler::{DispatchAlgorithm, Scheduler};

use log::debug;
use pointer::{MutPtr, Ptr};

/// The closure and control block a [`spawn`]ed fiber starts with, boxed
/// alongside it so the fiber's [`fiber::Start`] argument can be a single
/// thin pointer.
struct Payload<F> {
	control: MutPtr<FiberControl>,
	func: F
}

/// The [`fiber::Start`] every [`spawn`]ed fiber actually runs: reconstructs
/// its closure, runs it, and terminates the fiber. Never returns.
///
/// # Safety
/// `arg` must be a `Ptr<Payload<F>>` produced by [`spawn`]'s own
/// `Box::into_raw`, not yet reclaimed.
unsafe fn trampoline<F: FnOnce() + 'static>(arg: Ptr<()>) {
	/* Safety: guaranteed by caller */
	let payload = unsafe { Box::from_raw(arg.cast::<Payload<F>>().cast_mut().as_ptr()) };

	/* move the box's contents out (freeing its own allocation right here)
	 * instead of letting `payload` linger: `terminate` below never returns,
	 * so a `Box` still alive at that point would never run its destructor */
	let Payload { control, func } = *payload;

	func();

	/* Safety: this runs on `control`'s own fiber, immediately after its user
	 * function returns, exactly once */
	unsafe { FiberControl::terminate(control) }
}

/// Spawns `func` onto a new worker fiber on the calling thread's scheduler
/// and schedules it to run. `func` runs the next time the scheduler reaches
/// it in the ready queue; join the returned handle to wait for it to finish.
///
/// `stack_size` of `0` uses the platform default (`RLIMIT_STACK`).
///
/// # Errors
/// if the stack allocator fails to map a stack for the new fiber.
pub fn spawn<F: FnOnce() + 'static>(
	name: &str,
	stack_size: usize,
	func: F
) -> error::Result<MutPtr<FiberControl>> {
	let payload = Box::new(Payload { control: MutPtr::null(), func });
	let raw = MutPtr::from(Box::into_raw(payload));

	/* Safety: `trampoline::<F>` never unwinds (a user panic inside `func` is
	 * still UB across this boundary, same as any other fiber entry point) and
	 * always exits via `FiberControl::terminate` instead of returning */
	let start = unsafe { fiber::Start::new(trampoline::<F>, raw.cast_const().cast()) };

	let control = FiberControl::worker_with_stack_size(Name::new(name), start, stack_size)?;

	/* Safety: `raw` is still live and not yet aliased (the trampoline hasn't
	 * run); nothing else has touched it yet */
	unsafe { raw.as_mut().control = control };

	let scheduler = registry::scheduler();

	debug!("++ spawning '{name}'");

	/* Safety: scheduler is this thread's own, `control` was never attached */
	unsafe { FiberControl::start(control, scheduler.cast_const()) };

	Ok(control)
}
