//! Querying the platform's default worker stack size.

use super::OsError;

/// Default fiber stack size used when the OS reports no usable limit (e.g.
/// `RLIM_INFINITY`, which several platforms return for the soft stack
/// limit). 2 MiB matches the default `pthread` stack size on Linux/glibc.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Returns the calling thread's soft `RLIMIT_STACK`, or
/// [`DEFAULT_STACK_SIZE`] if the platform has no sensible answer.
///
/// # Errors
/// if the underlying `getrlimit` call fails.
pub fn stack_limit() -> Result<usize, OsError> {
	/* Safety: valid out-pointer, POSIX resource constant */
	let limit = unsafe {
		let mut limit = std::mem::MaybeUninit::<libc::rlimit>::uninit();

		if libc::getrlimit(libc::RLIMIT_STACK, limit.as_mut_ptr()) != 0 {
			return Err(OsError::last());
		}

		limit.assume_init()
	};

	let soft = limit.rlim_cur;

	if soft == libc::RLIM_INFINITY || soft == 0 {
		return Ok(DEFAULT_STACK_SIZE);
	}

	Ok(usize::try_from(soft).unwrap_or(DEFAULT_STACK_SIZE))
}
