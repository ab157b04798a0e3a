//! Filesystem view of the guest
//!
//! Path resolution confined to the guest root, idempotent mounts, and the
//! ordered mount plan.

pub mod filesystem;
pub mod plan;
pub mod resolve;

// Re-export commonly used items
pub use filesystem::*;
pub use resolve::{resolve, ResolvedPath, MAX_SYMLINK_FOLLOWS};
