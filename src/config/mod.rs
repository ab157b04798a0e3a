//! Configuration and request types
//!
//! Shared types, configuration loading, and request/environment validation.

pub mod loader;
pub mod types;
pub mod validator;
