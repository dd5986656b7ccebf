//! HTTP layer for the caching proxy.
//!
//! The axum router accepts Git smart-HTTP fetch requests, makes sure the
//! repository's mirror is ready and bridges the exchange to `git-upload-pack`
//! running against it.

pub mod auth;
pub mod bridge;
pub mod handler;
pub mod pktline;
