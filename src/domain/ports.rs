//! Domain Ports - Core trait definitions for the idmap middleware
//!
//! These traits define the boundaries between the idmap core and external
//! systems: the directory-service state machine, the relational datastore,
//! the secret store, the mapping daemon and its registry, and the
//! transactional cache table. Adapters implement these traits to provide
//! concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Directory Service Types
// =============================================================================

/// Directory services the appliance can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryServiceKind {
    ActiveDirectory,
    Ldap,
}

impl std::fmt::Display for DirectoryServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryServiceKind::ActiveDirectory => write!(f, "activedirectory"),
            DirectoryServiceKind::Ldap => write!(f, "ldap"),
        }
    }
}

/// Health of one directory service binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DirectoryServiceState {
    Disabled,
    Faulted,
    Joining,
    Healthy,
}

impl DirectoryServiceState {
    /// Whether the service is bound, even if the join has not settled yet.
    /// Range-overlap validation skips domains of unbound services.
    pub fn is_enabled(&self) -> bool {
        matches!(
            self,
            DirectoryServiceState::Healthy | DirectoryServiceState::Joining
        )
    }
}

/// Snapshot of the state of every directory service
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DirectoryServicesSnapshot {
    pub activedirectory: DirectoryServiceState,
    pub ldap: DirectoryServiceState,
}

impl DirectoryServicesSnapshot {
    pub fn state_of(&self, kind: DirectoryServiceKind) -> DirectoryServiceState {
        match kind {
            DirectoryServiceKind::ActiveDirectory => self.activedirectory,
            DirectoryServiceKind::Ldap => self.ldap,
        }
    }
}

/// LDAP directory configuration, consumed when rendering the daemon
/// configuration for the LDAP system domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapDirectoryConfig {
    pub basedn: String,
    pub uri_list: Vec<String>,
}

// =============================================================================
// Identity Types
// =============================================================================

/// Kind of Unix identity a mapping resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdType {
    User,
    Group,
    Both,
}

impl std::fmt::Display for IdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdType::User => write!(f, "USER"),
            IdType::Group => write!(f, "GROUP"),
            IdType::Both => write!(f, "BOTH"),
        }
    }
}

/// A Unix numeric identity together with its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnixId {
    pub id_type: IdType,
    pub id: u32,
}

/// A resolved SID <-> Unix identity correspondence.
///
/// Produced transiently by client-session calls; never persisted by this
/// core beyond the external daemon's own cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub sid: String,
    pub id_type: IdType,
    pub id: u32,
    /// `DOMAIN<sep>name` display form, when the daemon knows the name
    pub name: Option<String>,
}

/// Partial information about an identity that could not be mapped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmappedEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_type: Option<IdType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// Result of a bulk conversion. Callers must handle partial success;
/// unmapped keys are reported, never raised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkMappingResult {
    pub mapped: BTreeMap<String, IdentityMapping>,
    pub unmapped: BTreeMap<String, UnmappedEntry>,
}

/// Live information about a domain known to the mapping daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDomainInfo {
    pub netbios_domain: String,
    pub dns_name: Option<String>,
    pub sid: String,
    pub online: bool,
}

/// A local account known to the platform account database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAccount {
    pub name: String,
    pub id: u32,
}

// =============================================================================
// Directory Services Port
// =============================================================================

/// Port for the directory-service state machine and its configuration
#[async_trait]
pub trait DirectoryServices: Send + Sync {
    /// Health snapshot across all directory services
    async fn get_state(&self) -> Result<DirectoryServicesSnapshot>;

    /// The SMB workgroup / pre-Windows-2000 name of the local server
    async fn workgroup(&self) -> Result<String>;

    /// LDAP directory configuration, when the LDAP service is configured
    async fn ldap_config(&self) -> Result<Option<LdapDirectoryConfig>>;
}

// =============================================================================
// Certificate Store Port
// =============================================================================

/// Port for certificate lookups. Idmap domains only hold a foreign
/// reference; issuance and renewal live elsewhere.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn exists(&self, certificate_id: i64) -> Result<bool>;
}

// =============================================================================
// Secret Store Port
// =============================================================================

/// Port for the appliance secret store. Secrets are implicitly backed up
/// after every change.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store the directory-service bind secret for a domain
    async fn set_secret(&self, domain: &str, value: &str) -> Result<()>;

    /// Persist secrets to the backup location
    async fn backup(&self) -> Result<()>;
}

// =============================================================================
// Datastore Port
// =============================================================================

/// Comparison operator for datastore query filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
}

/// One predicate of a datastore query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl QueryFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }
}

/// Port for the persistent relational store. Rows are open JSON objects;
/// marshaling to domain types happens at the caller.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Insert a row, returning its assigned id
    async fn insert(&self, table: &str, row: serde_json::Value) -> Result<i64>;

    /// Replace the row with the given id
    async fn update(&self, table: &str, id: i64, row: serde_json::Value) -> Result<()>;

    /// Delete the row with the given id
    async fn delete(&self, table: &str, id: i64) -> Result<()>;

    /// Query rows matching all filter predicates
    async fn query(&self, table: &str, filters: &[QueryFilter]) -> Result<Vec<serde_json::Value>>;
}

// =============================================================================
// Service Control Port
// =============================================================================

/// Port for appliance service process control
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self, service: &str) -> Result<()>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn restart(&self, service: &str) -> Result<()>;
    async fn started(&self, service: &str) -> Result<bool>;
}

// =============================================================================
// Cache Table Port
// =============================================================================

/// Port for the persistent, transactional key-value cache table backing
/// the mapping daemon's allocation state. Keys and values are byte
/// strings; numeric values are little-endian u32.
///
/// Mirrors the transaction surface of the on-disk table it fronts:
/// mutations between `transaction_start` and `transaction_commit` are
/// atomic, and `transaction_cancel` discards them.
pub trait CacheTable: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Bytes>;
    fn store(&self, key: &[u8], value: Bytes);
    fn delete(&self, key: &[u8]);
    fn keys(&self) -> Vec<Bytes>;

    fn transaction_start(&self) -> Result<()>;
    fn transaction_commit(&self) -> Result<()>;
    fn transaction_cancel(&self);

    /// Whether the backing table has ever been initialized
    fn exists(&self) -> bool;

    /// Remove every entry, leaving an empty table
    fn wipe(&self) -> Result<()>;
}

// =============================================================================
// LDAP Client Port
// =============================================================================

/// Credentials for an LDAP simple bind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapBindCredentials {
    pub binddn: String,
    pub bindpw: String,
}

/// Transport security settings for an LDAP connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapSecurity {
    pub ssl: String,
    pub sasl: String,
    pub validate_certificates: bool,
}

/// Assembled client configuration for a trial connection against the
/// backend's LDAP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapClientConfig {
    pub uri_list: Vec<String>,
    pub basedn: String,
    pub bind_type: String,
    pub credentials: LdapBindCredentials,
    pub security: LdapSecurity,
}

/// Port for the external LDAP client used to verify bind secrets before
/// they are persisted
#[async_trait]
pub trait LdapClient: Send + Sync {
    async fn validate_credentials(&self, config: &LdapClientConfig) -> Result<()>;
}

// =============================================================================
// Mapping Daemon Ports
// =============================================================================

/// One live connection to the external mapping daemon.
///
/// Resolution calls return `None` for no-such-mapping rather than failing,
/// so bulk conversions can report partial success.
#[async_trait]
pub trait DaemonConnection: Send + Sync {
    async fn name_to_sid(&self, name: &str) -> Result<Option<IdentityMapping>>;
    async fn sid_to_name(&self, sid: &str) -> Result<Option<IdentityMapping>>;
    async fn sids_to_unix_ids(&self, sids: &[String]) -> Result<BulkMappingResult>;
    async fn unix_ids_to_sids(&self, ids: &[UnixId]) -> Result<BulkMappingResult>;
    async fn unix_id_to_sid(&self, id: UnixId) -> Result<Option<IdentityMapping>>;

    /// Info for one domain; `None` queries the daemon's own joined domain
    async fn domain_info(&self, domain: Option<&str>) -> Result<DaemonDomainInfo>;

    /// All domains the daemon currently knows about
    async fn all_domains(&self) -> Result<Vec<DaemonDomainInfo>>;

    /// Winbind separator between domain and account name
    fn separator(&self) -> char;
}

/// Port for establishing connections to the external mapping daemon.
/// `connect` fails with [`Error::DaemonUnavailable`] while the daemon
/// process is stopped.
///
/// [`Error::DaemonUnavailable`]: crate::error::Error::DaemonUnavailable
#[async_trait]
pub trait MappingDaemon: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn DaemonConnection>>;
}

/// Port for the mapping daemon's live configuration registry
#[async_trait]
pub trait DaemonRegistry: Send + Sync {
    /// Fetch the idmap-related keys of the live registry
    async fn fetch_idmap_config(&self) -> Result<BTreeMap<String, String>>;

    /// Apply a computed diff to the live registry
    async fn apply_diff(&self, diff: &ConfigDiff) -> Result<()>;

    /// Flush the daemon's generic cache
    async fn flush_cache(&self) -> Result<()>;
}

/// Three-way diff between desired and live daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub added: BTreeMap<String, String>,
    pub removed: BTreeMap<String, String>,
    pub modified: BTreeMap<String, String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

// =============================================================================
// Account Registry Port
// =============================================================================

/// Port for the platform account database, used for best-effort name
/// display and for recognizing local accounts that lack daemon mappings
#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn user_by_uid(&self, uid: u32) -> Result<Option<LocalAccount>>;
    async fn group_by_gid(&self, gid: u32) -> Result<Option<LocalAccount>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DirectoryServicesRef = Arc<dyn DirectoryServices>;
pub type CertificateStoreRef = Arc<dyn CertificateStore>;
pub type SecretStoreRef = Arc<dyn SecretStore>;
pub type DatastoreRef = Arc<dyn Datastore>;
pub type ServiceControlRef = Arc<dyn ServiceControl>;
pub type CacheTableRef = Arc<dyn CacheTable>;
pub type LdapClientRef = Arc<dyn LdapClient>;
pub type MappingDaemonRef = Arc<dyn MappingDaemon>;
pub type DaemonRegistryRef = Arc<dyn DaemonRegistry>;
pub type AccountRegistryRef = Arc<dyn AccountRegistry>;
