//! Stack allocation. This is the stack allocator collaborator the
//! specification describes in §6 (`allocate()` / `deallocate()`), implemented
//! directly against `mmap`/`mprotect`/`munmap` rather than behind a generic
//! allocator trait, since the fiber core is the only caller.

use enumflags2::{bitflags, BitFlags};

use super::OsError;
use crate::pointer::MutPtr;

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protection {
	Read  = 1 << 0,
	Write = 1 << 1,
	Exec  = 1 << 2
}

impl Protection {
	fn as_prot(flags: BitFlags<Self>) -> i32 {
		let mut prot = libc::PROT_NONE;

		if flags.contains(Self::Read) {
			prot |= libc::PROT_READ;
		}

		if flags.contains(Self::Write) {
			prot |= libc::PROT_WRITE;
		}

		if flags.contains(Self::Exec) {
			prot |= libc::PROT_EXEC;
		}

		prot
	}
}

/// An anonymous private mapping, used as a fiber's stack.
///
/// The mapping owns a leading guard page with no access permissions, so a
/// stack overflow faults instead of silently corrupting whatever mapping
/// happens to follow it in the address space.
pub struct Map {
	addr: MutPtr<u8>,
	/// length of the whole mapping, including the guard page
	mapped_len: usize,
	/// length usable as stack, i.e. `mapped_len` minus the guard page
	len: usize
}

pub struct Builder {
	size: usize,
	guard_page: bool
}

impl Builder {
	#[must_use]
	pub const fn new(size: usize) -> Self {
		Self { size, guard_page: true }
	}

	#[must_use]
	pub const fn guard_page(mut self, enabled: bool) -> Self {
		self.guard_page = enabled;
		self
	}

	/// # Errors
	/// if the underlying `mmap`/`mprotect` calls fail, e.g. because the
	/// process is out of address space or over its mapping count limit.
	pub fn map(self) -> Result<Map, OsError> {
		let page_size = page_size();
		let guard_len = if self.guard_page { page_size } else { 0 };
		let mapped_len = guard_len + round_up(self.size.max(page_size), page_size);

		/* Safety: anonymous, fixed-less mapping, no file descriptor involved */
		let addr = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				mapped_len,
				libc::PROT_NONE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
				-1,
				0
			)
		};

		if addr == libc::MAP_FAILED {
			return Err(OsError::last());
		}

		let addr = MutPtr::<u8>::from(addr.cast::<u8>());

		if self.guard_page {
			/* Safety: `addr` is the mapping we just created, `guard_len` is within
			 * its bounds */
			let result = unsafe { libc::mprotect(addr.as_ptr().cast(), guard_len, libc::PROT_NONE) };

			if result != 0 {
				let err = OsError::last();

				/* Safety: undoing the mapping we just created */
				unsafe { libc::munmap(addr.as_ptr().cast(), mapped_len) };

				return Err(err);
			}
		}

		let usable = mapped_len - guard_len;

		/* Safety: `addr + guard_len` is within the mapping, which is `mapped_len`
		 * long */
		let stack_addr = unsafe { addr.add(guard_len) };
		let prot = Protection::as_prot(Protection::Read | Protection::Write);

		/* Safety: `stack_addr..stack_addr+usable` is within the mapping and was
		 * allocated with `PROT_NONE` above, and is not currently in use */
		let result = unsafe { libc::mprotect(stack_addr.as_ptr().cast(), usable, prot) };

		if result != 0 {
			let err = OsError::last();

			/* Safety: undoing the mapping we just created */
			unsafe { libc::munmap(addr.as_ptr().cast(), mapped_len) };

			return Err(err);
		}

		Ok(Map { addr, mapped_len, len: usable })
	}
}

impl Map {
	/// An empty, unmapped placeholder. Used by the main fiber, which runs on
	/// the OS thread's native stack and owns no mapping of its own.
	#[must_use]
	pub const fn empty() -> Self {
		Self { addr: MutPtr::null(), mapped_len: 0, len: 0 }
	}

	/// The address of the first usable (non-guard-page) byte of the stack.
	#[must_use]
	pub const fn addr(&self) -> MutPtr<u8> {
		self.addr
	}

	#[must_use]
	pub const fn len(&self) -> usize {
		self.len
	}

	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Hints to the kernel that the stack's contents are no longer needed,
	/// letting it reclaim the physical pages without unmapping the virtual
	/// address range. Used when a fiber's stack is retired but the `Map`
	/// itself lives on (e.g. returned to a pool).
	pub fn advise_free(&mut self) {
		/* Safety: `addr..addr+len` is within the mapping and not in use while this
		 * runs (the fiber owning this stack is not currently executing) */
		unsafe {
			libc::madvise(self.addr.as_ptr().cast(), self.len, libc::MADV_DONTNEED);
		}
	}
}

impl Drop for Map {
	fn drop(&mut self) {
		if self.mapped_len == 0 {
			return;
		}

		let guard_len = self.mapped_len - self.len;

		/* Safety: `base - guard_len` recovers the start of the original mapping,
		 * `mapped_len` is its full length */
		unsafe {
			/* Safety: reverses `Builder::map`'s add(guard_len) */
			let base = self.addr.sub(guard_len);

			libc::munmap(base.as_ptr().cast(), self.mapped_len);
		}
	}
}

/* Safety: stack memory has no thread affinity */
unsafe impl Send for Map {}

fn page_size() -> usize {
	/* Safety: no arguments, always succeeds */
	let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

	usize::try_from(size).unwrap_or(4096)
}

const fn round_up(value: usize, align: usize) -> usize {
	(value + align - 1) / align * align
}
