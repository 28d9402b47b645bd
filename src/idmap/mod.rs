//! Identity-mapping subsystem
//!
//! Translates between Windows-style security identifiers (SIDs) and local
//! Unix numeric identities, allocates disjoint numeric ranges per mapping
//! domain, and keeps the mapping daemon's configuration and persistent
//! cache table consistent with the configured domains.
//!
//! - [`backend`]: static registry of mapping-backend kinds and their options
//! - [`builtins`]: well-known SIDs and deterministic builtin GID assignment
//! - [`domain`]: the persisted mapping-domain record and its canonical forms
//! - [`hash`]: deterministic hash slicer for SSSD-compatible low ranges
//! - [`range`]: numeric range allocation and overlap rules
//! - [`store`]: validated CRUD over mapping domains
//! - [`sync`]: daemon configuration synchronizer and cache maintenance

pub mod backend;
pub mod builtins;
pub mod domain;
pub mod hash;
pub mod range;
pub mod store;
pub mod sync;

pub use backend::{BackendOptions, IdmapBackend, OptionCheck, SslMode};
pub use domain::{DomainCreate, DomainUpdate, DsType, MappingDomain};
pub use store::DomainStore;
pub use sync::CacheSynchronizer;

/// Lowest numeric id a mapping domain may be authoritative for
pub const IDMAP_RANGE_MIN: u32 = 1000;

/// Platform maximum for idmap range bounds
pub const IDMAP_RANGE_MAX: u32 = 2_147_000_000;

/// Span of a freshly allocated domain range. Sized to accommodate the
/// highest RID value a domain may hand out.
pub const RANGE_ALLOCATION_SPAN: u32 = 100_000_000;

/// Service name of the external mapping daemon
pub const IDMAP_SERVICE: &str = "idmap";

/// Service name of the SMB file server that consumes the mappings
pub const SMB_SERVICE: &str = "cifs";
