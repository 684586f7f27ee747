//! `FiberControl` (component B): the per-fiber control block that sits
//! above the bare machine-context primitive in [`super`]. It tracks
//! identity, lifecycle flags, a manual reference count, and the intrusive
//! hooks the [`crate::scheduler::Scheduler`] links into its ready/sleep/
//! terminate queues and into another fiber's join `wait_queue`.
//!
//! A `FiberControl` is always heap allocated (`Box`) and never moved once
//! boxed: its `wait_queue` is a self-referential intrusive list, and the
//! scheduler keeps raw, non-owning pointers to it for the fiber's entire
//! lifetime.

use std::cell::{Cell, UnsafeCell};
use std::fmt::{self, Debug, Formatter};
use std::time::Instant;

use enumflags2::{bitflags, BitFlags};

use super::{Fiber, Start};
use crate::container::intrusive::{List, Node};
use crate::pointer::{MutPtr, Ptr};
use crate::scheduler::Scheduler;

/// Fixed-capacity, truncating label for a fiber. Bounded so `FiberControl`
/// never needs a second heap allocation just to remember a name.
pub const NAME_CAPACITY: usize = 16;

#[derive(Clone, Copy)]
pub struct Name {
	bytes: [u8; NAME_CAPACITY],
	len: u8
}

impl Name {
	#[must_use]
	pub fn new(name: &str) -> Self {
		let mut len = name.len().min(NAME_CAPACITY);

		/* don't split a multi-byte character at the truncation boundary */
		while len > 0 && !name.is_char_boundary(len) {
			len -= 1;
		}

		let mut bytes = [0u8; NAME_CAPACITY];

		bytes[..len].copy_from_slice(&name.as_bytes()[..len]);

		#[allow(clippy::cast_possible_truncation)]
		Self { bytes, len: len as u8 }
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		/* Safety: `new` only ever writes a prefix of a valid `&str`, truncated at
		 * a char boundary */
		#[allow(clippy::unwrap_used)]
		std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
	}
}

impl Default for Name {
	fn default() -> Self {
		Self::new("")
	}
}

impl Debug for Name {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
		Debug::fmt(self.as_str(), fmt)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
	Main,
	Dispatch,
	Worker
}

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Flags {
	Terminated = 1 << 0
}

/// The per-fiber control block (data model §3, `FiberControl`).
#[repr(C)]
pub struct FiberControl {
	kind: Kind,
	name: Name,
	use_count: Cell<usize>,
	flags: Cell<BitFlags<Flags>>,
	scheduler: Cell<Ptr<Scheduler>>,
	fiber: UnsafeCell<Fiber>,

	/// Bookkeeping only: the fiber that most recently resumed `self`. Not
	/// consulted by the scheduler's own decisions (those go entirely through
	/// the ready/sleep/terminate queues), but kept so debug assertions and a
	/// future collaborator can answer "who resumed me".
	entry: Cell<Ptr<FiberControl>>,

	pub(crate) ready_hook: Node,
	pub(crate) sleep_hook: Node,
	pub(crate) wait_hook: Node,
	pub(crate) terminate_hook: Node,

	wake_time: Cell<Option<Instant>>,

	/// Fibers that called [`FiberControl::join`] on `self` and are waiting
	/// for it to terminate.
	wait_queue: List
}

impl FiberControl {
	/// Heap-allocates a `FiberControl` wrapping `fiber`, with `use_count`
	/// starting at 1 (the reference the owner — whoever calls this — holds).
	/// Initialises the self-referential `wait_queue` once the box's address
	/// is final.
	fn new_boxed(kind: Kind, name: Name, fiber: Fiber) -> MutPtr<Self> {
		let boxed = Box::new(Self {
			kind,
			name,
			use_count: Cell::new(1),
			flags: Cell::new(BitFlags::empty()),
			scheduler: Cell::new(Ptr::null()),
			fiber: UnsafeCell::new(fiber),
			entry: Cell::new(Ptr::null()),
			ready_hook: Node::new(),
			sleep_hook: Node::new(),
			wait_hook: Node::new(),
			terminate_hook: Node::new(),
			wake_time: Cell::new(None),
			wait_queue: List::new()
		});

		let ptr = MutPtr::from(Box::into_raw(boxed));

		/* Safety: the box was just allocated, its address is final, and nothing
		 * else observes it yet */
		unsafe { ptr.as_ref().wait_queue.init() };

		ptr
	}

	/// The stub representing the OS thread's own native stack (invariant 1:
	/// no stack is owned by the core for `Kind::Main`).
	#[must_use]
	pub(crate) fn new_main() -> MutPtr<Self> {
		Self::new_boxed(Kind::Main, Name::new("main"), Fiber::main())
	}

	/// # Safety
	/// `scheduler` must outlive the returned control block (it does: the
	/// scheduler tears down the dispatcher before it tears down itself).
	#[must_use]
	pub(crate) unsafe fn new_dispatcher(scheduler: Ptr<Scheduler>) -> MutPtr<Self> {
		let control = Self::new_boxed(Kind::Dispatch, Name::new("dispatch"), Fiber::new());

		/* Safety: the fiber was never started */
		unsafe {
			let start = Start::new(crate::scheduler::dispatch::run, scheduler.cast());

			control.as_ref().fiber().as_mut().set_start(start);
		}

		control
	}

	/// Creates a new `WORKER` fiber ready to be handed to
	/// [`crate::scheduler::Scheduler::attach`] and
	/// [`FiberControl::start`]. Does not attach or schedule it.
	///
	/// # Errors
	/// if the stack allocator fails to map a stack for it.
	pub fn worker(name: Name, start: Start) -> crate::error::Result<MutPtr<Self>> {
		Self::worker_with_stack_size(name, start, 0)
	}

	/// Like [`FiberControl::worker`], but with an explicit stack size;
	/// `stack_size == 0` uses the platform default (`RLIMIT_STACK`).
	///
	/// # Errors
	/// if the stack allocator fails to map a stack for it.
	pub fn worker_with_stack_size(
		name: Name,
		start: Start,
		stack_size: usize
	) -> crate::error::Result<MutPtr<Self>> {
		let fiber = if stack_size == 0 {
			Fiber::try_new()?
		} else {
			Fiber::try_new_with_stack_size(stack_size)?
		};

		let control = Self::new_boxed(Kind::Worker, name, fiber);

		/* Safety: the fiber was never started */
		unsafe { control.as_ref().fiber().as_mut().set_start(start) };

		Ok(control)
	}

	#[must_use]
	pub fn kind(&self) -> Kind {
		self.kind
	}

	#[must_use]
	pub fn name(&self) -> &str {
		self.name.as_str()
	}

	#[must_use]
	pub fn is_terminated(&self) -> bool {
		self.flags.get().contains(Flags::Terminated)
	}

	#[must_use]
	pub fn use_count(&self) -> usize {
		self.use_count.get()
	}

	#[must_use]
	pub fn scheduler(&self) -> Ptr<Scheduler> {
		self.scheduler.get()
	}

	/// # Safety
	/// May only be called once per fiber (invariant: `scheduler` is settable
	/// exactly once per attach), by [`crate::scheduler::Scheduler::attach`].
	pub(crate) unsafe fn set_scheduler(&self, scheduler: Ptr<Scheduler>) {
		crate::assert_unsafe_precondition!(self.scheduler.get().is_null());

		self.scheduler.set(scheduler);
	}

	#[must_use]
	pub fn entry(&self) -> Ptr<FiberControl> {
		self.entry.get()
	}

	/// # Safety
	/// Only [`crate::scheduler::Scheduler`]'s low-level switch should call
	/// this; `resumer` must be the fiber that is about to switch to `self`.
	pub(crate) unsafe fn set_entry(&self, resumer: Ptr<FiberControl>) {
		self.entry.set(resumer);
	}

	/// # Safety
	/// `self` must not currently be running.
	#[allow(clippy::mut_from_ref)]
	pub(crate) unsafe fn fiber(&self) -> MutPtr<Fiber> {
		MutPtr::from(self.fiber.get())
	}

	#[must_use]
	pub fn wake_time(&self) -> Option<Instant> {
		self.wake_time.get()
	}

	/// # Safety
	/// `self` must not already be linked in the sleep queue.
	pub(crate) unsafe fn set_wake_time(&self, wake_time: Instant) {
		crate::assert_unsafe_precondition!(!self.sleep_hook.linked());

		self.wake_time.set(Some(wake_time));
	}

	pub(crate) fn wait_queue(&self) -> &List {
		&self.wait_queue
	}

	/// Increments the reference count. Pairs with [`FiberControl::release`].
	pub fn acquire(this: Ptr<Self>) {
		/* Safety: read-only, no aliasing concerns */
		let control = unsafe { this.as_ref() };

		control.use_count.set(control.use_count.get() + 1);
	}

	/// Drops one strong reference to `this`. When the count reaches zero the
	/// control block (and, for `WORKER`/`DISPATCH` fibers, the stack it owns)
	/// is reclaimed.
	///
	/// A fiber's stack cannot be unmapped while that fiber is the one
	/// currently executing — so if the last reference is released from
	/// `this`'s own fiber, destruction is deferred by linking `this` onto its
	/// scheduler's terminate queue instead of freeing it inline; the caller
	/// must then ensure control never returns onto this stack (it doesn't —
	/// this is exactly how [`FiberControl::terminate`] ends). `Kind::Main`
	/// never owns mapped stack memory (its `Fiber` is [`Fiber::main`], an
	/// empty placeholder), so releasing it is always safe to do inline, even
	/// from its own context.
	///
	/// # Safety
	/// `this` must currently hold a live strong reference (i.e. this is
	/// "give up the reference *I* hold", not "destroy regardless of other
	/// owners").
	pub unsafe fn release(this: MutPtr<Self>) {
		let control = unsafe { this.as_ref() };
		let count = control.use_count.get();

		crate::assert_unsafe_precondition!(count > 0);

		let remaining = count - 1;

		control.use_count.set(remaining);

		if remaining != 0 {
			return;
		}

		let releasing_own_stack =
			control.kind != Kind::Main && crate::registry::active() == this.cast_const();

		if releasing_own_stack {
			let scheduler = control.scheduler.get();

			crate::assert_unsafe_precondition!(!scheduler.is_null());

			/* Safety: `this` is not yet linked in the terminate queue: a fiber only
			 * releases its own last reference once, at the tail of `terminate` */
			unsafe { scheduler.as_ref().schedule_termination(this) };
		} else {
			/* Safety: either a different fiber is calling this (so destroying `this`
			 * doesn't free memory we're executing on), or `this` is `Kind::Main`,
			 * whose `Fiber` owns no mapped stack either way */
			unsafe { Self::destroy(this) };
		}
	}

	/// # Safety
	/// `this` must hold the last strong reference and must not be the
	/// currently executing fiber unless it is `Kind::Main`.
	unsafe fn destroy(this: MutPtr<Self>) {
		/* Safety: guaranteed by caller; reverses `new_boxed`'s `Box::into_raw` */
		drop(unsafe { Box::from_raw(this.as_ptr()) });
	}

	/// Attaches `this` to `scheduler` and links it into the ready queue.
	///
	/// # Safety
	/// `this` must not already be started or terminated.
	pub unsafe fn start(this: MutPtr<Self>, scheduler: Ptr<Scheduler>) {
		/* Safety: guaranteed by caller */
		unsafe { scheduler.as_ref().attach(this) };
		/* Safety: freshly attached, not linked anywhere yet */
		unsafe { scheduler.as_ref().mark_ready(this) };
	}

	/// Suspends the calling fiber until `this` terminates. Returns
	/// immediately if `this` is already terminated.
	///
	/// # Safety
	/// The caller must be the active fiber on this thread, must not be
	/// `this`, and must share a scheduler with `this`.
	pub unsafe fn join(this: Ptr<Self>) {
		let control = unsafe { this.as_ref() };

		if control.is_terminated() {
			return;
		}

		let caller = crate::registry::active();

		crate::assert_unsafe_precondition!(caller != this);

		/* Safety: guaranteed by caller */
		let caller_ref = unsafe { caller.as_ref() };

		crate::assert_unsafe_precondition!(caller_ref.scheduler.get() == control.scheduler.get());

		/* Safety: a fiber can only be actively joining one other fiber at a time,
		 * so `wait_hook` is never linked elsewhere while this runs */
		unsafe { control.wait_queue.push_back(crate::ptr!(&caller_ref.wait_hook)) };

		let scheduler = caller_ref.scheduler.get();

		/* Safety: scheduler is attached, caller is the active fiber */
		unsafe { scheduler.as_ref().preempt() };
	}

	/// Marks `this` terminated, wakes any joiners, and hands control to the
	/// scheduler. Never returns: `this`'s stack is never scheduled again.
	///
	/// # Safety
	/// Must be called from within `this`'s own running fiber, exactly once,
	/// immediately after its user function returns.
	pub unsafe fn terminate(this: MutPtr<Self>) -> ! {
		let control = unsafe { this.as_ref() };

		crate::assert_unsafe_precondition!(!control.is_terminated());
		control.flags.set(control.flags.get() | Flags::Terminated);

		let scheduler = control.scheduler.get();

		crate::assert_unsafe_precondition!(!scheduler.is_null());

		/* Safety: not yet linked; `terminate` runs at most once per fiber */
		unsafe { scheduler.as_ref().schedule_termination(this) };

		/* drain joiners front-to-back, waking each on its own scheduler (always
		 * the same scheduler in this single-threaded core) */
		/* Safety: wait_queue was init'd with the control block */
		while let Some(node) = unsafe { control.wait_queue.pop_front() } {
			let joiner = crate::container_of!(node, FiberControl: wait_hook).cast_mut();
			/* Safety: a joiner never releases itself while linked here */
			let joiner_scheduler = unsafe { joiner.as_ref().scheduler.get() };

			/* Safety: joiner was suspended via `preempt`, safe to re-ready */
			unsafe { joiner_scheduler.as_ref().mark_ready(joiner) };
		}

		/* Safety: scheduler is attached */
		unsafe { scheduler.as_ref().preempt() };

		/* `preempt` only returns once `this` is resumed again, which never happens
		 * for a terminated fiber: it is never re-linked into the ready queue */
		unsafe { crate::opt::hint::unreachable_unchecked() }
	}

	/// Voluntarily yields to the next runnable fiber, re-enqueuing `self` at
	/// the tail of the ready queue first.
	///
	/// # Safety
	/// Must be called from the active fiber.
	pub unsafe fn yield_now() {
		let this = crate::registry::active().cast_mut();
		/* Safety: `this` is running, so it's attached */
		let scheduler = unsafe { this.as_ref().scheduler.get() };

		/* Safety: the active fiber is never already linked in the ready queue */
		unsafe { scheduler.as_ref().mark_ready(this) };
		unsafe { scheduler.as_ref().preempt() };
	}
}

/* Safety: a `FiberControl` owns its stack outright and is only ever touched
 * from the single OS thread that runs it */
unsafe impl Send for FiberControl {}

impl PartialEq for FiberControl {
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Eq for FiberControl {}

impl Debug for FiberControl {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
		fmt.debug_struct("FiberControl")
			.field("kind", &self.kind)
			.field("name", &self.name)
			.field("terminated", &self.is_terminated())
			.field("use_count", &self.use_count.get())
			.finish()
	}
}
