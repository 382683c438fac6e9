//! Sectorbuild library exports.
//!
//! The binary in `main.rs` is a thin CLI over these modules; they are public
//! so integration tests can drive the pipeline directly.

pub mod build;
pub mod chroot;
pub mod config;
pub mod error;
pub mod fetch;
pub mod package;
pub mod preflight;
pub mod process;
pub mod spec;
pub mod stage;
