//! Execution control
//!
//! Launch strategies and the three session modes.

pub mod launcher;
pub mod session;
