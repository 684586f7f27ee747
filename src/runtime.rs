//! Process-level abort path for invariant violations.
//!
//! The core treats double-linking, destruction of an active fiber,
//! join-on-self, and scheduler mismatches as programming errors (see
//! `ERROR HANDLING` in the design notes): they are detected with assertions
//! and the process aborts rather than unwinding through fiber stacks that
//! may no longer be in a consistent state.

use std::fmt::Arguments;

/// Prints `fmt` as a fatal error and aborts the process without unwinding.
///
/// Unwinding across a fiber switch boundary is undefined behavior (the
/// landing pads on the other side belong to a different stack), so every
/// invariant violation in this crate funnels through here instead of
/// `panic!`.
#[cold]
pub fn panic_nounwind(fmt: Arguments<'_>) -> ! {
	#[cfg(feature = "logger")]
	crate::log::print_fatal(fmt);

	#[cfg(not(feature = "logger"))]
	eprintln!("fatal error: {fmt}");

	std::process::abort();
}
