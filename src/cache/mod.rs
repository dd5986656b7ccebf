//! Repository mirrors: the on-disk store and the per-request policy that
//! decides when a mirror is cloned, refreshed or served as it is.

pub mod manager;
pub mod store;

pub use manager::{CacheError, CacheManager};
pub use store::{GitMirrorStore, MirrorStore};
