//! Safety and cleanup
//!
//! Guarantees teardown of mounts and terminal state on every exit path.

pub mod teardown;
pub mod trap;
