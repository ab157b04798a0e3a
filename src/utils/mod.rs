//! Utilities
//!
//! Cross-cutting helpers shared by the launcher and the session.

pub mod env_hygiene;
