//! Zero-allocation intrusive data structures used to back the scheduler's
//! ready/sleep/wait/terminate queues.

pub mod intrusive;
