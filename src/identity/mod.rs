//! Guest identity data
//!
//! Account lookups in the guest's flat files and host/guest group alignment.

pub mod groups;
pub mod passwd;
