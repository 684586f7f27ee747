use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let thread = std::thread::current();
		let name = thread.name().unwrap_or("<unnamed>");

		eprintln!("[{name}] {:<5} {}", record.level(), record.args());
	}

	fn flush(&self) {}
}

lazy_static! {
	static ref LOGGER: StderrLogger = StderrLogger;
}

/// Installs [`StderrLogger`] as the global `log` backend and sets the
/// default level from `RUST_LOG`, if present. Runs once, before `main`, via
/// `ctor`, so any binary linking this crate gets scheduler diagnostics for
/// free unless it installs its own logger first (in which case
/// `set_logger`'s `Err` is ignored).
#[ctor::ctor]
fn init() {
	let level = std::env::var("RUST_LOG")
		.ok()
		.and_then(|level| level.parse().ok())
		.unwrap_or(LevelFilter::Warn);

	log::set_max_level(level);
	let _ = log::set_logger(&*LOGGER);
}
