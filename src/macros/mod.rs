//! Small helper macros shared across the crate. Kept separate from the
//! modules that use them so that `pointer` and `fiber` don't have to agree on
//! import order.

mod runtime;

pub use runtime::*;

#[macro_export]
macro_rules! import_sysdeps {
	() => {
		#[cfg(any(target_arch = "x86_64", doc))]
		mod x64;
		#[cfg(any(target_arch = "aarch64", doc))]
		mod arm64;

		mod platform {
			#[cfg(target_arch = "x86_64")]
			#[allow(unused_imports)]
			pub use super::x64::*;
			#[cfg(target_arch = "aarch64")]
			#[allow(unused_imports)]
			pub use super::arm64::*;
		}

		#[allow(unused_imports)]
		use platform::*;
	};
}

pub use import_sysdeps;
