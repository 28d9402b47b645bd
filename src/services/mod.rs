//! Appliance service adapters
//!
//! Concrete implementations of the system-facing ports: service process
//! control, directory-service state, certificate lookups, the platform
//! account database, the LDAP trial-bind client, and the mapping daemon's
//! configuration registry. These back standalone operation and tests; an
//! appliance deployment substitutes adapters over the real services.

use crate::domain::ports::{
    AccountRegistry, CertificateStore, ConfigDiff, DaemonRegistry, DirectoryServiceState,
    DirectoryServices, DirectoryServicesSnapshot, LdapClient, LdapClientConfig,
    LdapDirectoryConfig, LocalAccount, ServiceControl,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

// =============================================================================
// Service Control
// =============================================================================

/// Service control adapter tracking service run-state in memory
#[derive(Default)]
pub struct LocalServiceControl {
    running: RwLock<BTreeSet<String>>,
    events: Mutex<Vec<(String, String)>>,
}

impl LocalServiceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a service as running without recording an event
    pub fn seed_running(&self, service: &str) {
        self.running.write().insert(service.to_string());
    }

    /// Recorded (action, service) pairs, for test assertions
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().clone()
    }

    fn record(&self, action: &str, service: &str) {
        debug!(service, action, "service control");
        self.events
            .lock()
            .push((action.to_string(), service.to_string()));
    }
}

#[async_trait]
impl ServiceControl for LocalServiceControl {
    async fn start(&self, service: &str) -> Result<()> {
        self.record("start", service);
        self.running.write().insert(service.to_string());
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        self.record("stop", service);
        self.running.write().remove(service);
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        self.record("restart", service);
        self.running.write().insert(service.to_string());
        Ok(())
    }

    async fn started(&self, service: &str) -> Result<bool> {
        Ok(self.running.read().contains(service))
    }
}

// =============================================================================
// Directory Services
// =============================================================================

/// Directory-service accessor backed by a configured snapshot
pub struct StaticDirectoryServices {
    state: RwLock<DirectoryServicesSnapshot>,
    workgroup: RwLock<String>,
    ldap_config: RwLock<Option<LdapDirectoryConfig>>,
}

impl StaticDirectoryServices {
    pub fn new(workgroup: &str) -> Self {
        Self {
            state: RwLock::new(DirectoryServicesSnapshot {
                activedirectory: DirectoryServiceState::Disabled,
                ldap: DirectoryServiceState::Disabled,
            }),
            workgroup: RwLock::new(workgroup.to_string()),
            ldap_config: RwLock::new(None),
        }
    }

    pub fn set_activedirectory(&self, state: DirectoryServiceState) {
        self.state.write().activedirectory = state;
    }

    pub fn set_ldap(&self, state: DirectoryServiceState) {
        self.state.write().ldap = state;
    }

    pub fn set_ldap_config(&self, config: Option<LdapDirectoryConfig>) {
        *self.ldap_config.write() = config;
    }
}

#[async_trait]
impl DirectoryServices for StaticDirectoryServices {
    async fn get_state(&self) -> Result<DirectoryServicesSnapshot> {
        Ok(*self.state.read())
    }

    async fn workgroup(&self) -> Result<String> {
        Ok(self.workgroup.read().clone())
    }

    async fn ldap_config(&self) -> Result<Option<LdapDirectoryConfig>> {
        Ok(self.ldap_config.read().clone())
    }
}

// =============================================================================
// Certificate Store
// =============================================================================

/// Certificate lookups against a configured id set
#[derive(Default)]
pub struct StaticCertificateStore {
    ids: RwLock<BTreeSet<i64>>,
}

impl StaticCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: i64) {
        self.ids.write().insert(id);
    }
}

#[async_trait]
impl CertificateStore for StaticCertificateStore {
    async fn exists(&self, certificate_id: i64) -> Result<bool> {
        Ok(self.ids.read().contains(&certificate_id))
    }
}

// =============================================================================
// Account Registry
// =============================================================================

/// Platform account database backed by in-memory uid/gid tables
#[derive(Default)]
pub struct MemoryAccountRegistry {
    users: RwLock<BTreeMap<u32, String>>,
    groups: RwLock<BTreeMap<u32, String>>,
}

impl MemoryAccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, uid: u32, name: &str) {
        self.users.write().insert(uid, name.to_string());
    }

    pub fn add_group(&self, gid: u32, name: &str) {
        self.groups.write().insert(gid, name.to_string());
    }
}

#[async_trait]
impl AccountRegistry for MemoryAccountRegistry {
    async fn user_by_uid(&self, uid: u32) -> Result<Option<LocalAccount>> {
        Ok(self
            .users
            .read()
            .get(&uid)
            .map(|name| LocalAccount {
                name: name.clone(),
                id: uid,
            }))
    }

    async fn group_by_gid(&self, gid: u32) -> Result<Option<LocalAccount>> {
        Ok(self
            .groups
            .read()
            .get(&gid)
            .map(|name| LocalAccount {
                name: name.clone(),
                id: gid,
            }))
    }
}

// =============================================================================
// LDAP Client
// =============================================================================

/// Trial-bind client that accepts or rejects all credentials, recording
/// the configurations it was asked to validate
#[derive(Default)]
pub struct StaticLdapClient {
    reject: AtomicBool,
    validated: Mutex<Vec<LdapClientConfig>>,
}

impl StaticLdapClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    pub fn validated(&self) -> Vec<LdapClientConfig> {
        self.validated.lock().clone()
    }
}

#[async_trait]
impl LdapClient for StaticLdapClient {
    async fn validate_credentials(&self, config: &LdapClientConfig) -> Result<()> {
        self.validated.lock().push(config.clone());
        if self.reject.load(Ordering::Relaxed) {
            return Err(Error::LdapBind(format!(
                "bind as {} rejected",
                config.credentials.binddn
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Daemon Registry
// =============================================================================

/// Mapping-daemon configuration registry held in memory
#[derive(Default)]
pub struct MemoryDaemonRegistry {
    live: RwLock<BTreeMap<String, String>>,
    flushes: AtomicUsize,
}

impl MemoryDaemonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live configuration, for test assertions
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.live.read().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DaemonRegistry for MemoryDaemonRegistry {
    async fn fetch_idmap_config(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.live.read().clone())
    }

    async fn apply_diff(&self, diff: &ConfigDiff) -> Result<()> {
        let mut live = self.live.write();
        for key in diff.removed.keys() {
            live.remove(key);
        }
        for (key, value) in diff.added.iter().chain(diff.modified.iter()) {
            live.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn flush_cache(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_control_tracks_state() {
        let control = LocalServiceControl::new();
        assert!(!control.started("idmap").await.unwrap());

        control.start("idmap").await.unwrap();
        assert!(control.started("idmap").await.unwrap());

        control.stop("idmap").await.unwrap();
        assert!(!control.started("idmap").await.unwrap());

        let events = control.events();
        assert_eq!(events[0], ("start".to_string(), "idmap".to_string()));
        assert_eq!(events[1], ("stop".to_string(), "idmap".to_string()));
    }

    #[tokio::test]
    async fn test_registry_apply_diff() {
        let registry = MemoryDaemonRegistry::new();
        let mut diff = ConfigDiff::default();
        diff.added
            .insert("idmap config * : backend".to_string(), "tdb".to_string());
        registry.apply_diff(&diff).await.unwrap();

        let mut diff = ConfigDiff::default();
        diff.modified
            .insert("idmap config * : backend".to_string(), "autorid".to_string());
        registry.apply_diff(&diff).await.unwrap();

        assert_eq!(
            registry.snapshot()["idmap config * : backend"],
            "autorid".to_string()
        );

        let mut diff = ConfigDiff::default();
        diff.removed
            .insert("idmap config * : backend".to_string(), "autorid".to_string());
        registry.apply_diff(&diff).await.unwrap();
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_ldap_client_rejects_when_configured() {
        let client = StaticLdapClient::new();
        let config = LdapClientConfig {
            uri_list: vec!["ldap://ldap.example.com".to_string()],
            basedn: "dc=example,dc=com".to_string(),
            bind_type: "PLAIN".to_string(),
            credentials: crate::domain::ports::LdapBindCredentials {
                binddn: "cn=admin,dc=example,dc=com".to_string(),
                bindpw: "hunter2".to_string(),
            },
            security: crate::domain::ports::LdapSecurity {
                ssl: "OFF".to_string(),
                sasl: "SEAL".to_string(),
                validate_certificates: true,
            },
        };

        client.validate_credentials(&config).await.unwrap();
        client.set_reject(true);
        assert!(client.validate_credentials(&config).await.is_err());
        assert_eq!(client.validated().len(), 2);
    }
}
