//! guestroot: enter and tear down a chroot that shares the host kernel
//!
//! A session locates a guest root, arms its cleanup trap, builds the guest's
//! filesystem view with idempotent bind and tmpfs mounts, runs a login or a
//! command inside it, and unmounts everything on the way out.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::mount`]: Root-confined path resolution, idempotent mounts, the mount plan
//! - [`kernel::signal`]: Async-safe signal recording
//! - [`kernel::terminal`]: Terminal echo capture and restore
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launcher`]: Foreground and detached background launch
//! - [`exec::session`]: Interactive login, direct exec, setup-script loop
//!
//! ## Session Core ([`core`])
//! - [`core::session`]: Type-state entry sequence
//! - [`core::helpers`]: Mount-resolution helper and root lookup
//! - [`core::services`]: Guest D-Bus, rc.local, the active-name marker
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::trap`]: Exactly-once cleanup trap stack
//! - [`safety::teardown`]: Unmount-everything action
//!
//! ## Identity ([`identity`])
//! - [`identity::passwd`]: Guest passwd/group lookups
//! - [`identity::groups`]: Host/guest hardware group alignment
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: JSON configuration and environment overrides
//! - [`config::validator`]: Usage and precondition checks
//! - [`config::types`]: Shared types and the error taxonomy
//!
//! # Design Principles
//!
//! 1. **Teardown before mutation** - The unmount action is registered before the first mount
//! 2. **Fail closed** - A path that cannot be resolved inside the root is an error
//! 3. **Idempotent entry** - Re-entering a prepared root mounts nothing twice
//! 4. **No work in signal context** - Handlers record, the session unwinds

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Session core
pub mod core;

// Safety & Cleanup
pub mod safety;

// Guest identity data
pub mod identity;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the enter-chroot binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
