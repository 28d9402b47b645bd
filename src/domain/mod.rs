//! Core domain types and traits
//!
//! The [`ports`] module defines the boundaries between the idmap core and
//! the appliance services it collaborates with.

pub mod ports;

pub use ports::*;
