//! End-to-end boundary scenarios for the scheduler/fiber-control stack,
//! exercised through the crate's public API only. Each `#[test]` gets its
//! own OS thread from the default test harness, so each sees a fresh
//! thread-local registry (§4.5) without needing to call `registry::reset`
//! between cases.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use fiber_core::pointer::Ptr;
use fiber_core::{fiber_active, registry, set_custom_dispatcher, spawn, FiberControl, Scheduler};

fn active_scheduler() -> Ptr<Scheduler> {
	/* Safety: `fiber_active` always returns a live fiber attached to this
	 * thread's scheduler */
	unsafe { fiber_active().as_ref() }.scheduler()
}

/// Installs `env_logger` so `RUST_LOG=trace cargo test -- --nocapture` shows
/// the scheduler's fiber-lifecycle `trace!`/`debug!` output for whichever
/// test is running. Idempotent: every test calls this on its own thread, and
/// a second `try_init` elsewhere in the same process is just ignored.
fn init_logging() {
	let _ = env_logger::try_init();
}

/// Boundary scenario 1: construct the registry, then tear it down with
/// nothing ever attached. The dispatcher should enter `Run`, see
/// `shutdown && worker_count == 0` immediately, and switch straight back to
/// main without the teardown asserts in `Scheduler::drop` tripping.
#[test]
fn empty_scheduler_teardown() {
	init_logging();

	/* Safety: this thread has not yet started any fiber; main is the only
	 * thing attached to the current scheduler */
	unsafe { registry::reset() };
}

/// Boundary scenario 2: a single worker writes to shared state and returns;
/// joining it observes the write, leaves `worker_count` at zero, and the
/// worker is left on the terminate queue (not yet reclaimed) until something
/// calls `destroy_terminated`.
#[test]
fn single_worker_join() {
	init_logging();

	let value = Rc::new(Cell::new(0));
	let in_fiber = value.clone();

	let worker = spawn("writer", 0, move || in_fiber.set(42)).expect("stack allocation");

	/* Safety: caller (main) is the active fiber, shares a scheduler with
	 * `worker`, and is not `worker` itself */
	unsafe { FiberControl::join(worker.cast_const()) };

	assert_eq!(value.get(), 42);

	/* Safety: `worker` terminated via `join` above but hasn't been reclaimed
	 * yet, so it's still safe to read */
	let worker_ref = unsafe { worker.as_ref() };

	assert!(worker_ref.is_terminated());
	assert_eq!(worker_ref.use_count(), 1);

	let scheduler = active_scheduler();

	assert_eq!(unsafe { scheduler.as_ref() }.worker_count(), 0);

	/* Safety: called from main, not from any fiber linked in the terminate
	 * queue */
	unsafe { scheduler.as_ref().destroy_terminated() };
}

/// Boundary scenario 3: two workers started in order, each appending its id
/// to a shared list before yielding once and returning. FIFO scheduling
/// means both run to completion before `join(w1)` ever returns.
#[test]
fn two_workers_fifo() {
	init_logging();

	let order = Rc::new(RefCell::new(Vec::new()));

	let push = |id: i32, order: Rc<RefCell<Vec<i32>>>| {
		move || {
			order.borrow_mut().push(id);

			/* Safety: called from this closure's own active fiber */
			unsafe { FiberControl::yield_now() };
		}
	};

	let w1 = spawn("w1", 0, push(1, order.clone())).expect("stack allocation");
	let w2 = spawn("w2", 0, push(2, order.clone())).expect("stack allocation");

	/* Safety: see single_worker_join */
	unsafe { FiberControl::join(w1.cast_const()) };
	/* Safety: see single_worker_join */
	unsafe { FiberControl::join(w2.cast_const()) };

	assert_eq!(*order.borrow(), vec![1, 2]);
}

/// Boundary scenario 4: three workers sleep until distinct deadlines in
/// scrambled insertion order (30ms, 10ms, 20ms); the default dispatch loop's
/// `process_sleep` must wake them in non-decreasing deadline order.
#[test]
fn sleep_ordering() {
	init_logging();

	let order = Rc::new(RefCell::new(Vec::new()));
	let start = Instant::now();

	let sleeper = |delay_ms: u64, start: Instant, order: Rc<RefCell<Vec<u64>>>| {
		move || {
			let scheduler = active_scheduler();
			let this = fiber_active().cast_mut();
			let wake_time = start + Duration::from_millis(delay_ms);

			/* Safety: `this` is the active fiber and not linked in any sleep
			 * queue yet */
			unsafe { scheduler.as_ref().wait_until(wake_time, this) };

			order.borrow_mut().push(delay_ms);
		}
	};

	let w_30 = spawn("sleep-30", 0, sleeper(30, start, order.clone())).expect("stack allocation");
	let w_10 = spawn("sleep-10", 0, sleeper(10, start, order.clone())).expect("stack allocation");
	let w_20 = spawn("sleep-20", 0, sleeper(20, start, order.clone())).expect("stack allocation");

	/* Safety: see single_worker_join; each join drives the dispatcher's
	 * default loop (ready queue empty, sleep queue non-empty) until its
	 * target wakes and terminates */
	unsafe { FiberControl::join(w_30.cast_const()) };
	unsafe { FiberControl::join(w_10.cast_const()) };
	unsafe { FiberControl::join(w_20.cast_const()) };

	assert_eq!(*order.borrow(), vec![10, 20, 30]);
}

/// Q3's tie-break clause: two sleepers with the *same* deadline wake in
/// insertion order, not reversed.
#[test]
fn sleep_ordering_ties_preserve_insertion_order() {
	init_logging();

	let order = Rc::new(RefCell::new(Vec::new()));
	let start = Instant::now();
	let wake_time = start + Duration::from_millis(15);

	let sleeper = |id: i32, order: Rc<RefCell<Vec<i32>>>| {
		move || {
			let scheduler = active_scheduler();
			let this = fiber_active().cast_mut();

			/* Safety: see sleep_ordering */
			unsafe { scheduler.as_ref().wait_until(wake_time, this) };

			order.borrow_mut().push(id);
		}
	};

	let first = spawn("first", 0, sleeper(1, order.clone())).expect("stack allocation");
	let second = spawn("second", 0, sleeper(2, order.clone())).expect("stack allocation");

	/* Safety: see single_worker_join */
	unsafe { FiberControl::join(first.cast_const()) };
	unsafe { FiberControl::join(second.cast_const()) };

	assert_eq!(*order.borrow(), vec![1, 2]);
}

/// Boundary scenario 5: joining a fiber that has already terminated returns
/// immediately, without the caller ever suspending.
#[test]
fn join_on_already_terminated_returns_immediately() {
	init_logging();

	let worker = spawn("already-done", 0, || {}).expect("stack allocation");

	/* Safety: see single_worker_join */
	unsafe { FiberControl::join(worker.cast_const()) };

	/* Safety: already terminated above; `join` on a terminated fiber is a
	 * pure read (`is_terminated`) with no suspension, so this is still a
	 * live, attached `FiberControl` */
	assert!(unsafe { worker.as_ref() }.is_terminated());

	/* second join: must return immediately rather than suspend forever
	 * waiting on an empty wait_queue */
	unsafe { FiberControl::join(worker.cast_const()) };
}

/// Boundary scenario 6: a custom dispatcher that just pops the ready queue
/// once still lets a started worker run to completion, and scheduler
/// teardown succeeds (no `DispatcherRefusedWorkers`-style abort).
#[test]
fn custom_dispatcher_runs_worker_then_teardown_succeeds() {
	init_logging();

	/// # Safety
	/// Only ever installed as this test's [`fiber_core::DispatchAlgorithm`];
	/// runs on the dispatcher fiber with one worker in the ready queue.
	unsafe fn pop_ready_once(scheduler: Ptr<Scheduler>) {
		/* Safety: guaranteed by caller */
		unsafe { scheduler.as_ref().preempt() };
	}

	let ran = Rc::new(Cell::new(false));
	let in_fiber = ran.clone();

	set_custom_dispatcher(pop_ready_once);

	let _worker = spawn("custom-dispatched", 0, move || in_fiber.set(true)).expect("stack allocation");

	/* never joined: the custom dispatcher only gets a chance to run when the
	 * scheduler tears down and switches to the dispatcher for the first time */
	/* Safety: main is the only fiber with a live reference into this thread's
	 * registry at this point */
	unsafe { registry::reset() };

	assert!(ran.get());
}

/// Q2: `worker_count` tracks attached-but-not-yet-terminated `WORKER`
/// fibers, independent of how many have been joined so far.
#[test]
fn worker_count_tracks_attached_and_terminated_workers() {
	init_logging();

	let w1 = spawn("w1", 0, || {}).expect("stack allocation");
	let w2 = spawn("w2", 0, || {}).expect("stack allocation");

	let scheduler = active_scheduler();

	assert_eq!(unsafe { scheduler.as_ref() }.worker_count(), 2);

	/* Safety: see single_worker_join */
	unsafe { FiberControl::join(w1.cast_const()) };

	assert_eq!(unsafe { scheduler.as_ref() }.worker_count(), 1);

	unsafe { FiberControl::join(w2.cast_const()) };

	assert_eq!(unsafe { scheduler.as_ref() }.worker_count(), 0);
}
