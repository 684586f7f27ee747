use std::io;

/// A thin wrapper around `errno` for the handful of syscalls the stack
/// allocator makes. Kept distinct from [`crate::error::Error`] so the fiber
/// core's own invariant-violation errors never get confused with OS failures
/// propagated from a collaborator.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct OsError(#[from] io::Error);

impl OsError {
	#[must_use]
	pub fn last() -> Self {
		Self(io::Error::last_os_error())
	}

	#[must_use]
	pub fn raw_os_error(&self) -> Option<i32> {
		self.0.raw_os_error()
	}
}
