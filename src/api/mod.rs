//! Exposed API surface
//!
//! Thin REST surface over the idmap operations: domain CRUD, backend
//! metadata, bulk conversions, and cache maintenance. Wire dispatch stays
//! out of the core; handlers delegate directly to the domain store, the
//! client session, and the synchronizer.

pub mod rest;

pub use rest::{ApiState, RestRouter};
