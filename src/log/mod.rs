//! Minimal logging glue: the `log` crate's macros are re-exported for call
//! sites (always available; the scheduler/dispatcher/registry trace their
//! fiber-lifecycle events through them regardless of which `log::Log`
//! backend, if any, is installed), and behind the `logger` feature a
//! `ctor`-installed default logger means a binary that depends on this
//! crate gets reasonable stderr output without wiring up `env_logger` itself.

use std::fmt::Arguments;

pub use log::{debug, error, info, trace, warn, Level, LevelFilter};

#[cfg(feature = "logger")]
mod logger;

/// Prints `fmt` to stderr tagged with the current thread's name, bypassing
/// the `log` crate entirely. Used on the abort path in
/// [`crate::runtime::panic_nounwind`], where we'd rather not depend on a
/// logger being installed (or able to allocate) to report the failure.
pub fn print_fatal(fmt: Arguments<'_>) {
	let thread = std::thread::current();
	let name = thread.name().unwrap_or("<unnamed>");

	eprintln!("[{name}] fatal: {fmt}");
}
