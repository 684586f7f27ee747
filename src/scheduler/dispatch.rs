//! The dispatcher fiber (component D): the fiber the scheduler switches to
//! whenever no worker is ready. Built and owned entirely by
//! [`crate::scheduler::Scheduler::new_boxed`]; nothing outside this module
//! and `FiberControl::new_dispatcher` ever constructs one.

use std::time::Instant;

use super::Scheduler;
use crate::fiber::control::FiberControl;
use crate::log::{debug, trace};
use crate::pointer::Ptr;

/// Entry point of the dispatcher fiber (§4.4 `Run`). Installed as the
/// dispatcher's [`crate::fiber::Start`] by `FiberControl::new_dispatcher`;
/// runs exactly once, looping internally until the scheduler shuts down.
///
/// # Safety
/// `arg` must be the `Ptr<Scheduler>` that owns this dispatcher, live for as
/// long as the dispatcher is.
pub(crate) unsafe fn run(arg: Ptr<()>) {
	let scheduler = arg.cast::<Scheduler>();

	/* Safety: guaranteed by caller */
	let scheduler_ref = unsafe { scheduler.as_ref() };

	if let Some(algo) = scheduler_ref.take_custom_dispatcher() {
		debug!("== dispatcher entered (custom algorithm)");

		/* Safety: a custom dispatcher is handed the same scheduler a default
		 * loop would run against, and must only touch it through its public API */
		unsafe { algo(scheduler) };
	} else {
		debug!("== dispatcher entered (default loop)");

		/* Safety: see above */
		unsafe { default_loop(scheduler_ref) };
	}

	debug!("== dispatcher loop exited");

	/* `Scheduler::drop` aborts if a dispatch algorithm (default or custom)
	 * returns with workers still attached (§7); it checks this itself once we
	 * switch back to it below. */

	let main = scheduler_ref.main_fiber().cast_mut();

	/* Safety: main is still alive (it's what is tearing this scheduler down);
	 * this never returns, because main reclaims a dispatcher that has already
	 * finished looping directly rather than ever switching back into it (see
	 * the "control block embedded in its own stack" note in DESIGN.md) */
	unsafe { scheduler_ref.switch_to(main) };

	/* Safety: unreachable per the comment above */
	unsafe { crate::opt::hint::unreachable_unchecked() }
}

/// The reference default dispatch policy (§4.4a).
///
/// # Safety
/// `scheduler` must be the scheduler this dispatcher fiber belongs to, and
/// the dispatcher must be the active fiber.
unsafe fn default_loop(scheduler: &Scheduler) {
	loop {
		if scheduler.shutdown.get() && scheduler.worker_count.get() == 0 {
			return;
		}

		/* Safety: called from the dispatcher, never from a terminated fiber */
		unsafe { scheduler.destroy_terminated() };

		/* Safety: ready_queue was init'd alongside this scheduler */
		if let Some(node) = unsafe { scheduler.ready_queue.pop_front() } {
			let target = crate::container_of!(node, FiberControl: ready_hook).cast_mut();

			/* Safety: target came from this scheduler's own ready queue */
			unsafe { scheduler.switch_to(target) };
			continue;
		}

		/* Safety: dispatcher is the active fiber */
		unsafe { scheduler.process_sleep(Instant::now()) };

		if !scheduler.ready_queue.is_empty() {
			continue;
		}

		trace!(".. dispatcher suspending, nothing runnable");
		suspend(scheduler);
	}
}

/// The suspension hook (§4.4a, §9 open question): when both the ready and
/// sleep queues are empty, the reference dispatch loop blocks on an external
/// readiness source this core doesn't define. Absent a real I/O-driven
/// collaborator, this core parks the OS thread up to the next sleep-queue
/// deadline so single-threaded examples and tests make progress instead of
/// busy-spinning; see DESIGN.md for why this is not the final word on
/// suspension — a real runtime built on this core is expected to install a
/// [`super::DispatchAlgorithm`] that blocks on its own readiness source
/// instead.
fn suspend(scheduler: &Scheduler) {
	let next_wake = scheduler.sleep_queue.front().map(|node| {
		let f = crate::container_of!(node, FiberControl: sleep_hook);

		/* Safety: every fiber linked in the sleep queue has a wake_time */
		unsafe { f.as_ref() }.wake_time().unwrap_or_else(Instant::now)
	});

	match next_wake {
		Some(wake_time) => {
			let now = Instant::now();

			if wake_time > now {
				std::thread::park_timeout(wake_time - now);
			}
		}
		/* nothing sleeping and nothing ready: wait for an external wake (e.g. a
		 * cross-thread collaborator unparking this thread) */
		None => std::thread::park()
	}
}
