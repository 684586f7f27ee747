//! Compiler hint helpers used on the hot paths of the scheduler.

pub mod hint;
