//! Cache Synchronizer
//!
//! Reconciles the persisted mapping-domain configuration against the
//! mapping daemon's live registry (three-way diff, applied incrementally)
//! and maintains the daemon's persistent allocation table: high-water-mark
//! tracking, stale-entry eviction, and deterministic builtin repair.

use crate::domain::ports::{
    CacheTable, CacheTableRef, ConfigDiff, DaemonRegistry, DaemonRegistryRef, Datastore,
    DatastoreRef, DirectoryServiceState, DirectoryServices, DirectoryServicesRef, QueryFilter,
    ServiceControl, ServiceControlRef,
};
use crate::error::{Error, Result};
use crate::idmap::backend::IdmapBackend;
use crate::idmap::builtins::{
    builtin_assignments, BuiltinAssignment, WELL_KNOWN_PADDING, WINBINDD_AUTO_ALLOCATED,
};
use crate::idmap::domain::{DsType, MappingDomain, DOMAIN_TABLE};
use crate::idmap::{IDMAP_SERVICE, SMB_SERVICE};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const KEY_IDMAP_VERSION: &[u8] = b"IDMAP_VERSION\x00";
const KEY_USER_HWM: &[u8] = b"USER HWM\x00";
const KEY_GROUP_HWM: &[u8] = b"GROUP HWM\x00";
const IDMAP_TABLE_VERSION: u32 = 2;

fn hwm_bytes(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

fn parse_hwm(raw: &Bytes) -> Option<u32> {
    raw.as_ref().try_into().ok().map(u32::from_le_bytes)
}

fn sid_key(sid: &str) -> Vec<u8> {
    format!("{sid}\0").into_bytes()
}

fn gid_key(gid: u32) -> Vec<u8> {
    format!("GID {gid}\0").into_bytes()
}

/// Whether a directory-service state is live enough that its idmap
/// configuration must be rendered
fn render_enabled(state: DirectoryServiceState) -> bool {
    matches!(
        state,
        DirectoryServiceState::Healthy
            | DirectoryServiceState::Joining
            | DirectoryServiceState::Faulted
    )
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Bool(true) => "yes".to_string(),
        serde_json::Value::Bool(false) => "no".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pushes domain configuration to the mapping daemon and maintains its
/// persistent cache tables
pub struct CacheSynchronizer {
    datastore: DatastoreRef,
    directory: DirectoryServicesRef,
    registry: DaemonRegistryRef,
    services: ServiceControlRef,
    /// The daemon's mapping cache, wiped wholesale on forced clears
    daemon_cache: CacheTableRef,
    /// The daemon's allocation table carrying the high-water marks
    idmap_cache: CacheTableRef,
    /// Cache clears stop and start the shared daemon; at most one runs
    /// and at most one more may wait
    clear_lock: Mutex<()>,
    clear_waiters: AtomicUsize,
}

impl CacheSynchronizer {
    pub fn new(
        datastore: DatastoreRef,
        directory: DirectoryServicesRef,
        registry: DaemonRegistryRef,
        services: ServiceControlRef,
        daemon_cache: CacheTableRef,
        idmap_cache: CacheTableRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            datastore,
            directory,
            registry,
            services,
            daemon_cache,
            idmap_cache,
            clear_lock: Mutex::new(()),
            clear_waiters: AtomicUsize::new(0),
        })
    }

    async fn domains(&self) -> Result<Vec<MappingDomain>> {
        let rows = self.datastore.query(DOMAIN_TABLE, &[]).await?;
        rows.into_iter().map(MappingDomain::from_row).collect()
    }

    // =========================================================================
    // Configuration rendering
    // =========================================================================

    /// Flatten the configured domains into the daemon's registry keys,
    /// applying the system-domain aliasing rules
    pub async fn render_daemon_conf(
        &self,
        domains: &[MappingDomain],
    ) -> Result<BTreeMap<String, String>> {
        let mut rv = BTreeMap::new();
        let state = self.directory.get_state().await?;
        let workgroup = self.directory.workgroup().await?;
        let ad_enabled = render_enabled(state.activedirectory);
        let ldap_enabled = render_enabled(state.ldap);

        let ad_idmap = if ad_enabled {
            domains
                .iter()
                .find(|d| d.name == DsType::ActiveDirectory.name())
        } else {
            None
        };
        let mut disable_ldap_starttls = false;

        for domain in domains {
            let alias = if domain.name == DsType::DefaultDomain.name() {
                // Superseded entirely while autorid is in effect
                if ad_idmap.map(|d| d.idmap_backend) == Some(IdmapBackend::Autorid) {
                    continue;
                }
                "*".to_string()
            } else if domain.name == DsType::ActiveDirectory.name() {
                if !ad_enabled {
                    continue;
                }
                if domain.idmap_backend == IdmapBackend::Autorid {
                    "*".to_string()
                } else {
                    workgroup.clone()
                }
            } else if domain.name == DsType::Ldap.name() {
                if !ldap_enabled {
                    continue;
                }
                if domain.idmap_backend == IdmapBackend::Ldap {
                    // The default LDAP backend renders from the directory
                    // service's own configuration
                    if let Some(ldap) = self.directory.ldap_config().await? {
                        let prefix = format!("idmap config {workgroup} :");
                        rv.insert(
                            format!("{prefix} backend"),
                            domain.idmap_backend.as_config_value(),
                        );
                        rv.insert(
                            format!("{prefix} range"),
                            format!("{} - {}", domain.range_low, domain.range_high),
                        );
                        rv.insert(format!("{prefix} ldap_base_dn"), ldap.basedn.clone());
                        rv.insert(format!("{prefix} ldap_url"), ldap.uri_list.join(" "));
                        continue;
                    }
                }
                workgroup.clone()
            } else {
                domain.name.clone()
            };

            let prefix = format!("idmap config {alias} :");
            rv.insert(
                format!("{prefix} backend"),
                domain.idmap_backend.as_config_value(),
            );
            rv.insert(
                format!("{prefix} range"),
                format!("{} - {}", domain.range_low, domain.range_high),
            );

            for (key, value) in &domain.options {
                let parameter = if key == "cn_realm" { "realm" } else { key };
                let rendered = match key.as_str() {
                    "ldap_server" => {
                        if value.as_str() == Some("AD") {
                            "ad".to_string()
                        } else {
                            "stand-alone".to_string()
                        }
                    }
                    "ldap_url" => {
                        let scheme = if domain.options.get("ssl").and_then(|v| v.as_str())
                            == Some("ON")
                        {
                            "ldaps://"
                        } else {
                            "ldap://"
                        };
                        format!("{scheme}{}", render_value(value))
                    }
                    "ssl" => {
                        if value.as_str() != Some("START_TLS") {
                            disable_ldap_starttls = true;
                        }
                        continue;
                    }
                    _ => render_value(value),
                };
                rv.insert(format!("{prefix} {parameter}"), rendered);
            }
        }

        if ad_enabled {
            rv.insert(
                "ldap ssl".to_string(),
                if disable_ldap_starttls {
                    "off".to_string()
                } else {
                    "start tls".to_string()
                },
            );
        }

        Ok(rv)
    }

    /// Three-way diff between desired and live configuration
    pub fn diff_conf_and_registry(
        desired: &BTreeMap<String, String>,
        live: &BTreeMap<String, String>,
    ) -> ConfigDiff {
        let mut diff = ConfigDiff::default();
        for (key, value) in desired {
            match live.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(existing) if existing != value => {
                    diff.modified.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        for (key, value) in live {
            if !desired.contains_key(key) {
                diff.removed.insert(key.clone(), value.clone());
            }
        }
        diff
    }

    /// Push the configured domains to the daemon registry, applying only
    /// the computed diff, and optionally restart the daemon to pick the
    /// changes up
    pub async fn synchronize(&self, restart: bool) -> Result<()> {
        let domains = self.domains().await?;
        let desired = self.render_daemon_conf(&domains).await?;
        let live = self.registry.fetch_idmap_config().await?;
        let diff = Self::diff_conf_and_registry(&desired, &live);

        if !diff.is_empty() {
            debug!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                modified = diff.modified.len(),
                "applying idmap configuration diff"
            );
            self.registry.apply_diff(&diff).await?;
        }

        if restart {
            self.services.restart(IDMAP_SERVICE).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Forced cache clear
    // =========================================================================

    /// Stop the daemon, wipe its mapping cache, flush the generic cache,
    /// and start it again, restoring the SMB service if it was running.
    /// Globally serialized: one clear in flight, at most one more waiting;
    /// further requests are rejected rather than queued.
    pub async fn clear_cache(&self) -> Result<()> {
        if self.clear_waiters.fetch_add(1, Ordering::SeqCst) >= 2 {
            self.clear_waiters.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Internal(
                "cache clear already in progress with a pending request".to_string(),
            ));
        }

        let result = self.clear_cache_locked().await;
        self.clear_waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn clear_cache_locked(&self) -> Result<()> {
        let _guard = self.clear_lock.lock().await;

        let smb_started = self.services.started(SMB_SERVICE).await?;
        self.services.stop(IDMAP_SERVICE).await?;

        if let Err(err) = self.daemon_cache.wipe() {
            debug!(error = %err, "failed to remove the daemon mapping cache");
        }

        self.registry.flush_cache().await?;

        self.services.start(IDMAP_SERVICE).await?;
        if smb_started {
            self.services.start(SMB_SERVICE).await?;
        }
        info!("cleared idmap cache");
        Ok(())
    }

    // =========================================================================
    // Builtin assignments
    // =========================================================================

    /// Deterministic builtin GID assignments. Empty unless the default
    /// domain uses the TDB backend: allocating backends hand out their
    /// own ids for the default domain.
    pub async fn builtins(&self) -> Result<Vec<BuiltinAssignment>> {
        match self.default_domain().await? {
            Some(domain) if domain.idmap_backend == IdmapBackend::Tdb => {
                Ok(builtin_assignments(domain.range_low))
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn default_domain(&self) -> Result<Option<MappingDomain>> {
        let rows = self
            .datastore
            .query(
                DOMAIN_TABLE,
                &[QueryFilter::eq("name", DsType::DefaultDomain.name())],
            )
            .await?;
        rows.into_iter().next().map(MappingDomain::from_row).transpose()
    }

    // =========================================================================
    // High-water-mark maintenance
    // =========================================================================

    /// Validate the allocation table against the statically reserved id
    /// space: bump the group high-water mark above the builtins, evict
    /// persisted mappings that collide with them, and repair builtin
    /// SID<->GID pairs that drifted. Runs in a single transaction; any
    /// failure rolls back and is logged, never surfaced. Returns whether
    /// anything changed.
    pub async fn validate_high_water_mark(&self, low_range: u32) -> bool {
        match self.validate_hwm_inner(low_range).await {
            Ok(must_reload) => must_reload,
            Err(err) => {
                self.idmap_cache.transaction_cancel();
                warn!(error = %err, "idmap allocation table maintenance failed");
                false
            }
        }
    }

    async fn validate_hwm_inner(&self, low_range: u32) -> Result<bool> {
        let mut must_reload = false;
        let builtins = self.builtins().await?;
        let auto_allocated = WINBINDD_AUTO_ALLOCATED.len() as u32;

        if !self.idmap_cache.exists() {
            self.idmap_cache
                .store(KEY_IDMAP_VERSION, hwm_bytes(IDMAP_TABLE_VERSION));
            self.idmap_cache.store(KEY_USER_HWM, hwm_bytes(low_range));
            self.idmap_cache.store(KEY_GROUP_HWM, hwm_bytes(low_range));
        }

        self.idmap_cache.transaction_start()?;

        let hwm = self
            .idmap_cache
            .get(KEY_GROUP_HWM)
            .as_ref()
            .and_then(parse_hwm)
            .unwrap_or(low_range);
        let reserved_ceiling = low_range + auto_allocated + builtins.len() as u32;
        if hwm < reserved_ceiling {
            self.idmap_cache.store(
                KEY_GROUP_HWM,
                hwm_bytes(reserved_ceiling + WELL_KNOWN_PADDING),
            );
            must_reload = true;
        }

        // Evict persisted group mappings that collide with statically
        // reserved ids; the daemon regenerates them as needed
        for key in self.idmap_cache.keys() {
            // sample key: b"GID 9000020\x00"
            if !key.starts_with(b"GID ") {
                continue;
            }
            let gid = std::str::from_utf8(&key[4..key.len().saturating_sub(1)])
                .ok()
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(gid) = gid {
                if gid < low_range + auto_allocated {
                    let reverse = self.idmap_cache.get(&key);
                    self.idmap_cache.delete(&key);
                    if let Some(reverse) = reverse {
                        self.idmap_cache.delete(&reverse);
                    }
                    must_reload = true;
                }
            }
        }

        for entry in builtins.iter().filter(|e| e.set) {
            let sid = sid_key(&entry.sid);
            let expected = Bytes::from(gid_key(entry.gid));
            let current = self.idmap_cache.get(&sid);
            if current.as_ref() == Some(&expected) {
                continue;
            }

            if let Some(current) = current {
                debug!(
                    sid = %entry.sid,
                    gid = entry.gid,
                    "incorrect sid mapping detected, replacing"
                );
                self.idmap_cache.delete(&sid);
                self.idmap_cache.delete(&current);
            }
            self.idmap_cache.store(&expected, Bytes::from(sid.clone()));
            self.idmap_cache.store(&sid, expected);
            must_reload = true;
        }

        self.idmap_cache.transaction_commit()?;
        Ok(must_reload)
    }
}
