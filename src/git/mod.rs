//! Git process wrappers.
//!
//! All operations shell out to the `git` binaries using
//! `tokio::process::Command` for non-blocking execution, with `kill_on_drop`
//! so that abandoned work does not outlive its caller.

pub mod commands;
pub mod upload_pack;
