//! Idmap Middleware - Identity-Mapping Control Plane
//!
//! Management middleware for a storage appliance's identity-mapping
//! subsystem: translating between Windows-style security identifiers
//! (SIDs) and local Unix numeric identities, allocating disjoint numeric
//! ranges per mapping domain, and keeping the external mapping daemon's
//! configuration and persistent cache tables consistent with the
//! configured domains.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Idmap Control Plane                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐  ┌────────────────┐  ┌────────────────────────┐  │
//! │  │   REST API    │  │  Domain Store  │  │   Cache Synchronizer   │  │
//! │  │   (axum)      │──│  (validated    │──│  (config diff + HWM    │  │
//! │  │               │  │   CRUD)        │  │   maintenance)         │  │
//! │  └───────┬───────┘  └───────┬────────┘  └───────────┬────────────┘  │
//! │          │                  │                       │               │
//! │          │         ┌────────┴────────┐              │               │
//! │          └─────────┤ Backend Registry│              │               │
//! │                    │ Range Allocator │              │               │
//! │                    │ Hash Slicer     │              │               │
//! │                    └────────┬────────┘              │               │
//! ├─────────────────────────────┼───────────────────────┼───────────────┤
//! │                      Collaborator Ports                             │
//! │  ┌──────────────┐ ┌────────────────┐ ┌──────────────────────────┐   │
//! │  │  Datastore   │ │ Mapping Daemon │ │ Directory Services /     │   │
//! │  │  Secret      │ │ + Registry +   │ │ Certificates / Accounts  │   │
//! │  │  Cache Table │ │ Service Control│ │ / LDAP Client            │   │
//! │  └──────────────┘ └────────────────┘ └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`idmap`]: domain records, backend registry, range allocation, hash
//!   slicer, validated CRUD, cache synchronization
//! - [`daemon`]: client sessions against the external mapping daemon
//! - [`domain`]: collaborator ports and shared identity types
//! - [`api`]: REST surface
//! - [`persistence`] / [`services`]: in-memory adapters for the ports
//! - [`error`]: error types and aggregated validation

pub mod api;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod idmap;
pub mod persistence;
pub mod services;

// Re-export commonly used types
pub use api::{ApiState, RestRouter};
pub use daemon::{ClientSession, LoopbackDaemon, RetryPolicy};
pub use domain::ports::{
    BulkMappingResult, DaemonDomainInfo, DirectoryServiceKind, DirectoryServiceState,
    IdType, IdentityMapping, QueryFilter, UnixId,
};
pub use error::{Error, Result, ValidationErrors};
pub use idmap::{
    BackendOptions, CacheSynchronizer, DomainCreate, DomainStore, DomainUpdate, DsType,
    IdmapBackend, MappingDomain,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
