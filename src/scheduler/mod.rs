//! The per-OS-thread scheduler (component C): owns the ready/sleep/
//! terminate queues and the dispatcher fiber, and is the only thing that
//! ever invokes a raw [`crate::fiber::Fiber::switch`] on behalf of higher
//! level operations (`start`, `join`, `terminate`, voluntary yield, sleep).
//!
//! There is exactly one `Scheduler` per OS thread, owned by the thread-local
//! [`crate::registry`] (component E) alongside that thread's main fiber.

use std::cell::Cell;
use std::time::Instant;

use crate::container::intrusive::List;
use crate::fiber::control::{FiberControl, Kind};
use crate::log::{debug, trace};
use crate::pointer::{MutPtr, Ptr};

pub mod dispatch;

/// A user-installable replacement for the default dispatch loop (§4.4). Runs
/// on the dispatcher fiber and owns the entire dispatch policy for as long
/// as it runs; the default loop never runs once one is installed.
///
/// # Safety
/// Implementations run on the dispatcher's stack with the dispatcher as the
/// active fiber; they must only touch `scheduler` through its public API and
/// must return with `worker_count() == 0` or the scheduler aborts at
/// teardown (§7).
pub type DispatchAlgorithm = unsafe fn(Ptr<Scheduler>);

pub struct Scheduler {
	main_ctx: Ptr<FiberControl>,
	dispatch_ctx: Cell<MutPtr<FiberControl>>,
	ready_queue: List,
	sleep_queue: List,
	terminate_queue: List,
	worker_count: Cell<usize>,
	shutdown: Cell<bool>,

	/// A caller-installed replacement for the default dispatch loop, consumed
	/// the one time the dispatcher fiber runs. Lives here rather than in the
	/// thread-local registry so the dispatcher (which is handed this
	/// `Scheduler` directly as its `Start` argument, see
	/// `FiberControl::new_dispatcher`) never has to reach back into the
	/// registry while it's in the middle of being torn down — see
	/// `registry::reset` in DESIGN.md for why that would be unsound.
	custom_dispatcher: Cell<Option<DispatchAlgorithm>>
}

impl Scheduler {
	/// Builds a new scheduler and its dispatcher fiber, attaching both `main`
	/// and the dispatcher. `main`'s address must already be final.
	pub(crate) fn new_boxed(main: MutPtr<FiberControl>) -> MutPtr<Self> {
		let boxed = Box::new(Self {
			main_ctx: main.cast_const(),
			dispatch_ctx: Cell::new(MutPtr::null()),
			ready_queue: List::new(),
			sleep_queue: List::new(),
			terminate_queue: List::new(),
			worker_count: Cell::new(0),
			shutdown: Cell::new(false),
			custom_dispatcher: Cell::new(None)
		});

		let ptr = MutPtr::from(Box::into_raw(boxed));

		/* Safety: just boxed, address is final */
		unsafe {
			ptr.as_ref().ready_queue.init();
			ptr.as_ref().sleep_queue.init();
			ptr.as_ref().terminate_queue.init();
		}

		/* Safety: scheduler's address is now final; main was constructed by the
		 * caller (the thread registry) and is not attached anywhere yet */
		unsafe { ptr.as_ref().attach(main) };

		/* Safety: scheduler outlives the dispatcher it creates (it tears the
		 * dispatcher down before dropping itself) */
		let dispatcher = unsafe { FiberControl::new_dispatcher(ptr.cast_const()) };

		/* Safety: freshly created, not attached anywhere yet */
		unsafe { ptr.as_ref().attach(dispatcher) };
		ptr.as_ref().dispatch_ctx.set(dispatcher);

		debug!("++ scheduler constructed");

		ptr
	}

	#[must_use]
	pub fn main_fiber(&self) -> Ptr<FiberControl> {
		self.main_ctx
	}

	#[must_use]
	pub fn dispatcher(&self) -> MutPtr<FiberControl> {
		self.dispatch_ctx.get()
	}

	#[must_use]
	pub fn worker_count(&self) -> usize {
		self.worker_count.get()
	}

	#[must_use]
	pub fn is_shutdown(&self) -> bool {
		self.shutdown.get()
	}

	/// Installs `algo` as the dispatch routine this scheduler's dispatcher
	/// fiber runs the one time it's entered, in place of the default loop
	/// (§4.4 step 2). Has no effect if the dispatcher has already run.
	pub(crate) fn set_custom_dispatcher(&self, algo: DispatchAlgorithm) {
		self.custom_dispatcher.set(Some(algo));
	}

	pub(crate) fn take_custom_dispatcher(&self) -> Option<DispatchAlgorithm> {
		self.custom_dispatcher.take()
	}

	/// Binds `f` to this scheduler. Does not link it into any queue.
	///
	/// # Safety
	/// `f` must not already be attached to a scheduler.
	pub unsafe fn attach(&self, f: MutPtr<FiberControl>) {
		/* Safety: guaranteed by caller */
		let control = unsafe { f.as_ref() };

		unsafe { control.set_scheduler(crate::ptr!(self)) };

		/* Safety: read-only */
		if control.kind() == Kind::Worker {
			self.worker_count.set(self.worker_count.get() + 1);

			trace!("++ attached '{}' ({} worker(s))", control.name(), self.worker_count.get());
		}
	}

	/// Links `f` onto the tail of the ready queue.
	///
	/// # Safety
	/// `f` must not already be linked in the ready, sleep, or terminate
	/// queue.
	pub unsafe fn mark_ready(&self, f: MutPtr<FiberControl>) {
		/* Safety: guaranteed by caller */
		let control = unsafe { f.as_ref() };

		crate::assert_unsafe_precondition!(!control.ready_hook.linked());

		trace!("-> '{}' ready", control.name());

		/* Safety: `f` outlives its membership in this list (it's either running
		 * or waiting to run) */
		unsafe { self.ready_queue.push_back(crate::ptr!(&control.ready_hook)) };
	}

	/// Chooses the next runnable fiber: the head of the ready queue, or the
	/// dispatcher if the ready queue is empty.
	fn next_runnable(&self) -> MutPtr<FiberControl> {
		/* Safety: ready_queue was init'd alongside this scheduler */
		if let Some(node) = unsafe { self.ready_queue.pop_front() } {
			crate::container_of!(node, FiberControl: ready_hook).cast_mut()
		} else {
			self.dispatch_ctx.get()
		}
	}

	/// Suspends the calling fiber, switching to the next runnable fiber (or
	/// the dispatcher). Returns once the caller is itself resumed again,
	/// yielding the fiber that resumed it. The caller is responsible for
	/// having already re-linked itself wherever it wants to be found again
	/// (ready queue, sleep queue, a wait queue, ...) — `preempt` never
	/// re-enqueues the fiber that calls it.
	///
	/// # Safety
	/// Must be called from the active fiber on this scheduler.
	pub unsafe fn preempt(&self) -> Ptr<FiberControl> {
		let target = self.next_runnable();

		/* Safety: guaranteed by caller; target came from this scheduler's own
		 * ready queue or is its own dispatcher */
		unsafe { self.switch_to(target) };

		/* Safety: by the time `switch_to` returns, this fiber is active again, and
		 * whoever most recently resumed it is recorded in its own `entry` */
		unsafe { crate::registry::active().as_ref().entry() }
	}

	/// The low-level context switch: records `target` as the active fiber,
	/// records the outgoing fiber as `target`'s resumer, and transfers
	/// control (§4.2 `SwitchTo`).
	///
	/// # Safety
	/// `target` must be attached to this scheduler, not null, and not
	/// already running.
	unsafe fn switch_to(&self, target: MutPtr<FiberControl>) {
		let previous = crate::registry::active();

		/* Safety: both fibers are attached and live for the duration of this call;
		 * only dereferenced once the `trace!` call below decides it's enabled */
		trace!(
			"== switching '{}' -> '{}'",
			unsafe { previous.as_ref() }.name(),
			unsafe { target.as_ref() }.name()
		);

		/* Safety: guaranteed by caller */
		unsafe { crate::registry::set_active(target.cast_const()) };
		/* Safety: guaranteed by caller */
		unsafe { target.as_ref().set_entry(previous) };

		/* Safety: `previous` is the fiber currently executing this function */
		let from_fiber = unsafe { previous.as_ref().fiber() };
		/* Safety: guaranteed by caller */
		let to_fiber = unsafe { target.as_ref().fiber() };

		/* Safety: both fibers are attached and live for this thread's lifetime */
		unsafe { crate::fiber::Fiber::switch(from_fiber, to_fiber) };
	}

	/// Links `f` onto the terminate queue; decrements `worker_count` if `f`
	/// is a `WORKER`. Does not free anything.
	///
	/// # Safety
	/// `f` must not already be linked in the terminate queue.
	pub unsafe fn schedule_termination(&self, f: MutPtr<FiberControl>) {
		/* Safety: guaranteed by caller */
		let control = unsafe { f.as_ref() };

		crate::assert_unsafe_precondition!(!control.terminate_hook.linked());

		/* Safety: `f` stays linked until `destroy_terminated` reclaims it */
		unsafe { self.terminate_queue.push_back(crate::ptr!(&control.terminate_hook)) };

		if control.kind() == Kind::Worker {
			self.worker_count.set(self.worker_count.get() - 1);
		}

		trace!("-- '{}' terminated ({} worker(s) left)", control.name(), self.worker_count.get());
	}

	/// Drains the terminate queue, releasing one strong reference to each
	/// entry. Must never be called from the fiber being destroyed — safe to
	/// call from the main fiber or the dispatcher.
	///
	/// # Safety
	/// The caller must not be any fiber currently linked in the terminate
	/// queue.
	pub unsafe fn destroy_terminated(&self) {
		/* Safety: terminate_queue was init'd alongside this scheduler */
		while let Some(node) = unsafe { self.terminate_queue.pop_front() } {
			let f = crate::container_of!(node, FiberControl: terminate_hook).cast_mut();

			/* Safety: `f` is linked in the terminate queue, so it's still live */
			trace!("xx reclaiming '{}'", unsafe { f.as_ref() }.name());

			/* Safety: guaranteed by caller: `f` isn't the active fiber */
			unsafe { FiberControl::release(f) };
		}
	}

	/// Parks the calling fiber in the sleep queue (ordered by `wake_time`,
	/// ties broken by insertion order) and preempts.
	///
	/// # Safety
	/// `this` must be the active fiber and not already linked in the sleep
	/// queue.
	pub unsafe fn wait_until(&self, wake_time: Instant, this: MutPtr<FiberControl>) {
		/* Safety: guaranteed by caller */
		unsafe { this.as_ref().set_wake_time(wake_time) };

		/* Safety: `this` is the active fiber, so it's live */
		trace!("zz '{}' sleeping until {:?}", unsafe { this.as_ref() }.name(), wake_time);

		let mut cursor = self.sleep_queue.front();
		let mut inserted = false;

		while let Some(node) = cursor {
			let other = crate::container_of!(node, FiberControl: sleep_hook);

			/* Safety: every fiber linked in the sleep queue has a wake_time */
			let other_wake = unsafe { other.as_ref().wake_time() }
				.unwrap_or(wake_time);

			if other_wake > wake_time {
				/* Safety: `this` isn't linked anywhere else; `node` is linked here */
				unsafe {
					self.sleep_queue
						.insert_before(crate::ptr!(&this.as_ref().sleep_hook), node);
				}

				inserted = true;

				break;
			}

			/* Safety: node is linked in this list */
			cursor = unsafe { self.sleep_queue.next(node) };
		}

		if !inserted {
			/* Safety: `this` isn't linked anywhere else */
			unsafe { self.sleep_queue.push_back(crate::ptr!(&this.as_ref().sleep_hook)) };
		}

		/* Safety: guaranteed by caller */
		unsafe { self.preempt() };
	}

	/// Moves every sleeper whose `wake_time` has passed into the ready
	/// queue, in non-decreasing `wake_time` order.
	///
	/// # Safety
	/// None beyond this scheduler being alive; safe to call from any fiber.
	pub unsafe fn process_sleep(&self, now: Instant) {
		loop {
			let Some(node) = self.sleep_queue.front() else {
				break;
			};

			let f = crate::container_of!(node, FiberControl: sleep_hook).cast_mut();

			/* Safety: linked in the sleep queue, so it has a wake_time */
			let wake_time = unsafe { f.as_ref().wake_time() }.unwrap_or(now);

			if wake_time > now {
				break;
			}

			/* Safety: node is linked in this list */
			unsafe { self.sleep_queue.remove(node) };

			/* Safety: `f` was just unlinked from the sleep queue, so it's still live */
			trace!("zz '{}' woke", unsafe { f.as_ref() }.name());

			/* Safety: just unlinked from the sleep queue, not linked anywhere else */
			unsafe { self.mark_ready(f) };
		}
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		debug!("-- scheduler shutting down ({} worker(s) attached)", self.worker_count.get());

		self.shutdown.set(true);

		let dispatcher = self.dispatch_ctx.get();

		/* Safety: `drop` only ever runs on the thread's main fiber, the only
		 * fiber still alive at this point besides a possibly-parked dispatcher;
		 * switching in resumes (or starts) the dispatch loop, which observes
		 * `shutdown` and returns once every worker has terminated */
		unsafe { self.switch_to(dispatcher) };

		if self.worker_count.get() > 0 {
			crate::panic_nounwind!(
				"custom dispatcher returned with {} worker(s) still attached",
				self.worker_count.get()
			);
		}

		/* Safety: called from main, not from the dispatcher (which just parked
		 * itself by switching back to us) */
		unsafe { self.destroy_terminated() };

		/* the dispatcher is reclaimed directly rather than through the terminate
		 * queue: it never terminates in the worker sense, it just stops looping */
		/* Safety: main is running, dispatcher is parked, not `main`'s own stack */
		unsafe { FiberControl::release(dispatcher) };

		crate::assert_unsafe_precondition!(self.ready_queue.is_empty());
		crate::assert_unsafe_precondition!(self.sleep_queue.is_empty());
		crate::assert_unsafe_precondition!(self.terminate_queue.is_empty());
	}
}

/* Safety: a `Scheduler` is only ever touched from the single OS thread that
 * owns it (it lives in that thread's thread-local registry) */
unsafe impl Send for Scheduler {}
