#[macro_export]
macro_rules! panic_nounwind {
	($($arg: tt)*) => {
		$crate::runtime::panic_nounwind(::std::format_args!($($arg)*))
	}
}

pub use panic_nounwind;

/// Asserts a precondition of an `unsafe` function. In debug builds this
/// aborts with a message; in release builds it tells the optimizer the
/// condition can be assumed true, same as a `debug_assert!` that also holds
/// in release mode.
#[macro_export]
macro_rules! assert_unsafe_precondition {
	($condition:expr) => {
		$crate::assert_unsafe_precondition!($condition, ::std::stringify!($condition))
	};

	($condition:expr, $($arg: tt)*) => {{
		#[cfg(debug_assertions)]
		if !$condition {
			$crate::panic_nounwind!(
				"Unsafe precondition(s) violated: {}",
				::std::format_args!($($arg)*)
			);
		}

		#[cfg(not(debug_assertions))]
		/* Safety: guaranteed by caller */
		unsafe {
			$crate::opt::hint::assume($condition);
		}
	}};
}

pub use assert_unsafe_precondition;
