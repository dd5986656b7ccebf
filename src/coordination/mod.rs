//! In-process coordination between concurrent requests.
//!
//! Mirrors are the only shared mutable resource.  The [`locks::LockTable`]
//! serialises mutations per repository and coalesces concurrent requests for
//! the same mutation; there is no global lock.

pub mod locks;

pub use locks::{Aborted, LockTable};
