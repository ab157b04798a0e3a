//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here and in the launcher, with explicit
//! SAFETY comments.
//! Dependency direction: signal -> terminal -> mount

pub mod mount;
pub mod signal;
pub mod terminal;
