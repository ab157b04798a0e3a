//! Chroot entry core.
//!
//! Core owns the session lifecycle: locating the root, arming cleanup,
//! building the filesystem view, and handing off to the session executor.

pub mod helpers;
pub mod services;
pub mod session;
