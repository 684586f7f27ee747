//! The thread-local registry (component E): the active fiber pointer, the
//! per-thread [`Scheduler`], and the main fiber stub, all lazily constructed
//! on first access and torn down in reverse order either at [`reset`] or
//! when the OS thread exits (§4.5).

use std::cell::{Cell, RefCell};

use crate::fiber::control::FiberControl;
use crate::log::debug;
use crate::pointer::{MutPtr, Ptr};
use crate::scheduler::{DispatchAlgorithm, Scheduler};

struct Registry {
	active: Cell<Ptr<FiberControl>>,
	main: MutPtr<FiberControl>,
	scheduler: MutPtr<Scheduler>
}

impl Registry {
	fn new() -> Self {
		debug!("++ registry constructed for this thread");

		let main = FiberControl::new_main();
		let scheduler = Scheduler::new_boxed(main);

		Self {
			active: Cell::new(main.cast_const()),
			main,
			scheduler
		}
	}
}

impl Drop for Registry {
	fn drop(&mut self) {
		/* Safety: this only ever runs on the thread's own main fiber (thread
		 * teardown, or an explicit `reset` call from main). Dropping the
		 * scheduler drives the dispatcher to exit its loop and drains every
		 * queue (see `Scheduler`'s `Drop` impl) before this returns. */
		unsafe { drop(Box::from_raw(self.scheduler.as_ptr())) };

		/* Safety: `main`'s `Fiber` owns no mapped stack (it's the OS thread's own
		 * native stack), so releasing it inline, even while still running on
		 * that stack, never frees memory this code is executing on */
		unsafe { FiberControl::release(self.main) };
	}
}

thread_local! {
	static REGISTRY: RefCell<Registry> = RefCell::new(Registry::new());
}

/// The fiber currently running on this OS thread.
#[must_use]
pub fn fiber_active() -> Ptr<FiberControl> {
	REGISTRY.with(|registry| registry.borrow().active.get())
}

/// Internal alias used throughout the scheduler/fiber layers; identical to
/// [`fiber_active`], which is the name the boundary API exposes to callers.
#[must_use]
pub(crate) fn active() -> Ptr<FiberControl> {
	fiber_active()
}

/// # Safety
/// `fiber` must actually be the fiber now executing on this OS thread.
pub(crate) unsafe fn set_active(fiber: Ptr<FiberControl>) {
	REGISTRY.with(|registry| registry.borrow().active.set(fiber));
}

/// The scheduler for this OS thread.
#[must_use]
pub(crate) fn scheduler() -> MutPtr<Scheduler> {
	REGISTRY.with(|registry| registry.borrow().scheduler)
}

/// Installs an alternative dispatch routine for this thread's current
/// scheduler, taking effect the next time its dispatcher is entered (§4.4
/// step 2). There is no "current" dispatch run to interrupt: the dispatcher
/// is only ever entered once per scheduler lifetime (it loops internally),
/// at scheduler teardown, so in practice this must be called before the
/// scheduler is torn down (before the first fiber is started, or before an
/// empty teardown). Stored on the `Scheduler` itself, not in this registry —
/// see `Scheduler::take_custom_dispatcher` for why.
pub fn set_custom_dispatcher(algo: DispatchAlgorithm) {
	let scheduler = self::scheduler();

	/* Safety: this thread's own scheduler, always live */
	unsafe { scheduler.as_ref().set_custom_dispatcher(algo) };
}

/// Tears down this thread's scheduler and main fiber immediately instead of
/// waiting for the OS thread to exit, then lazily rebuilds a fresh one on
/// the next access. Any attached workers or a custom dispatcher still get a
/// chance to run during teardown, exactly as they would at thread exit (see
/// `Scheduler`'s `Drop` impl) — this just triggers that teardown early.
///
/// # Safety
/// Must be called from this thread's main fiber (never from a worker or the
/// dispatcher).
pub unsafe fn reset() {
	REGISTRY.with(|registry| registry.replace(Registry::new()));
}
