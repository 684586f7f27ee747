//! The thin OS boundary the fiber core needs: a stack allocator and the
//! platform's default stack size. Everything else (epoll, sockets, timers,
//! ...) lives with the collaborators described in the specification, not
//! here.

pub mod mman;
pub mod resource;

mod error;

pub use error::OsError;
