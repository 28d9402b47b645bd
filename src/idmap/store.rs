//! Domain Store
//!
//! Validated CRUD over mapping domains. Every mutation runs the full
//! validation pass (aggregating violations before rejecting), persists the
//! record, and pushes the resulting configuration to the mapping daemon.
//! The validate-then-persist sequence is serialized by a store-scoped
//! mutex so concurrent mutations cannot both pass overlap validation
//! against a stale snapshot.

use crate::daemon::client::ClientSession;
use crate::domain::ports::{
    CertificateStore, CertificateStoreRef, Datastore, DatastoreRef, DirectoryServiceState,
    DirectoryServices, DirectoryServicesRef, LdapBindCredentials, LdapClient, LdapClientConfig,
    LdapClientRef, LdapSecurity, QueryFilter, SecretStore, SecretStoreRef,
};
use crate::error::{Error, Result, ValidationErrors};
use crate::idmap::backend::{self, BackendOptions, IdmapBackend, OptionCheck, SslMode};
use crate::idmap::domain::{DomainCreate, DomainUpdate, DsType, MappingDomain, DOMAIN_TABLE};
use crate::idmap::hash::{sssd_low_range, SssdRangeParams, SSSD_HASH_SEED};
use crate::idmap::range::{check_range_conflicts, next_range};
use crate::idmap::sync::CacheSynchronizer;
use crate::idmap::{IDMAP_RANGE_MAX, IDMAP_RANGE_MIN, RANGE_ALLOCATION_SPAN};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SECRET_OPTION: &str = "ldap_user_dn_password";

fn opt_str<'a>(options: &'a BTreeMap<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    options.get(key).and_then(|v| v.as_str())
}

fn opt_truthy(options: &BTreeMap<String, serde_json::Value>, key: &str) -> bool {
    options.get(key).map(is_truthy).unwrap_or(false)
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::Null => false,
        _ => true,
    }
}

/// Whether the provided options ask for encrypted LDAP transport
fn options_request_encryption(options: &BTreeMap<String, serde_json::Value>) -> bool {
    opt_str(options, "ssl")
        .map(|s| !s.eq_ignore_ascii_case(SslMode::Off.as_str()))
        .unwrap_or(false)
}

/// A domain with its optional live daemon information
#[derive(Debug, Clone, serde::Serialize)]
pub struct DomainEntry {
    #[serde(flatten)]
    pub domain: MappingDomain,
    pub domain_info: Option<crate::domain::ports::DaemonDomainInfo>,
}

/// Validated CRUD over the persisted mapping-domain set
pub struct DomainStore {
    datastore: DatastoreRef,
    directory: DirectoryServicesRef,
    certificates: CertificateStoreRef,
    secrets: SecretStoreRef,
    ldap: LdapClientRef,
    session: Arc<ClientSession>,
    sync: Arc<CacheSynchronizer>,
    /// Serializes every validate-then-persist sequence
    mutation_lock: Mutex<()>,
}

impl DomainStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datastore: DatastoreRef,
        directory: DirectoryServicesRef,
        certificates: CertificateStoreRef,
        secrets: SecretStoreRef,
        ldap: LdapClientRef,
        session: Arc<ClientSession>,
        sync: Arc<CacheSynchronizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            datastore,
            directory,
            certificates,
            secrets,
            ldap,
            session,
            sync,
            mutation_lock: Mutex::new(()),
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn query(&self, filters: &[QueryFilter]) -> Result<Vec<MappingDomain>> {
        let rows = self.datastore.query(DOMAIN_TABLE, filters).await?;
        rows.into_iter().map(MappingDomain::from_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<MappingDomain> {
        self.query(&[QueryFilter::eq("id", id)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound {
                kind: "idmap_domain".to_string(),
                name: id.to_string(),
            })
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<MappingDomain>> {
        Ok(self
            .query(&[QueryFilter::eq("name", name)])
            .await?
            .into_iter()
            .next())
    }

    /// Query domains, optionally enriched with live daemon info. Domains
    /// the daemon does not know stay in the result with no info attached.
    pub async fn query_extended(
        &self,
        filters: &[QueryFilter],
        include_domain_info: bool,
    ) -> Result<Vec<DomainEntry>> {
        let mut out = Vec::new();
        for domain in self.query(filters).await? {
            let domain_info = if include_domain_info {
                match self.session.domain_info(&domain.name).await {
                    Ok(info) => info,
                    Err(err) => {
                        if err.daemon_code()
                            != Some(crate::daemon::codes::WBC_ERR_DOMAIN_NOT_FOUND)
                        {
                            debug!(
                                domain = %domain.name,
                                error = %err,
                                "failed to retrieve domain info"
                            );
                        }
                        None
                    }
                }
            } else {
                None
            };
            out.push(DomainEntry {
                domain,
                domain_info,
            });
        }
        Ok(out)
    }

    /// Next free id range for a new domain
    pub async fn next_range(&self) -> Result<(u32, u32)> {
        let domains = self.query(&[]).await?;
        next_range(&domains)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    async fn validate(
        &self,
        schema: &str,
        candidate: &MappingDomain,
        existing: &[MappingDomain],
        verrors: &mut ValidationErrors,
    ) -> Result<()> {
        let ds_choices = IdmapBackend::ds_choices();

        if candidate.name == DsType::Ldap.name()
            && !ds_choices[&crate::domain::ports::DirectoryServiceKind::Ldap]
                .contains(&candidate.idmap_backend)
        {
            verrors.add(
                format!("{schema}.idmap_backend"),
                format!(
                    "idmap backend [{}] is not appropriate for the system domain type {}",
                    candidate.idmap_backend, candidate.name
                ),
            );
        } else if candidate.name == DsType::DefaultDomain.name()
            && candidate.idmap_backend != IdmapBackend::Tdb
        {
            verrors.add(
                format!("{schema}.idmap_backend"),
                "TDB is the only supported idmap backend for DS_TYPE_DEFAULT_DOMAIN.",
            );
        }

        for (field, value) in [
            ("range_low", candidate.range_low),
            ("range_high", candidate.range_high),
        ] {
            if !(IDMAP_RANGE_MIN..=IDMAP_RANGE_MAX).contains(&value) {
                verrors.add(
                    format!("{schema}.{field}"),
                    format!(
                        "{value} is not between {IDMAP_RANGE_MIN} and {IDMAP_RANGE_MAX}"
                    ),
                );
            }
        }

        if candidate.range_high < candidate.range_low {
            // Nothing downstream is meaningful with an inverted range
            verrors.add(
                format!("{schema}.range_low"),
                "Idmap high range must be greater than idmap low range",
            );
            return Ok(());
        }

        if let Some(certificate_id) = candidate.certificate_id {
            if !self.certificates.exists(certificate_id).await? {
                verrors.add(
                    format!("{schema}.certificate"),
                    "Please specify a valid certificate.",
                );
            }
        }

        let ds_state = self.directory.get_state().await?;

        for other in existing {
            if other.id == candidate.id {
                continue;
            }
            if other.name == candidate.name {
                verrors.add(format!("{schema}.name"), "Name must be unique.");
            }
            if candidate.dns_domain_name.is_some()
                && other.dns_domain_name == candidate.dns_domain_name
            {
                verrors.add(
                    format!("{schema}.dns_domain_name"),
                    "DNS domain names must be unique.",
                );
            }
        }

        check_range_conflicts(
            schema,
            Some(candidate.id),
            &candidate.name,
            candidate.idmap_backend,
            candidate.range_low,
            candidate.range_high,
            existing,
            &ds_state,
            verrors,
        );

        Ok(())
    }

    /// Derive an SSSD-compatible range for a domain, failing fast unless
    /// the AD directory service is healthy
    async fn sssd_range(
        &self,
        schema: &str,
        domain_name: &str,
        verrors: &mut ValidationErrors,
    ) -> Result<(u32, u32)> {
        let state = self.directory.get_state().await?;
        if state.activedirectory != DirectoryServiceState::Healthy {
            verrors.add(
                format!("{schema}.options"),
                "AD service must be enabled and started to generate an \
                 SSSD-compatible id range",
            );
            verrors.check()?;
        }

        let info = self
            .session
            .domain_info(domain_name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "domain".to_string(),
                name: domain_name.to_string(),
            })?;

        let low = sssd_low_range(&info.sid, &SssdRangeParams::default(), SSSD_HASH_SEED)?;
        Ok((low, low + RANGE_ALLOCATION_SPAN))
    }

    // =========================================================================
    // Secret handling
    // =========================================================================

    /// Assemble the LDAP client configuration for a trial connection from
    /// the typed backend options
    fn client_config(
        backend: IdmapBackend,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> Result<LdapClientConfig> {
        let typed = BackendOptions::from_map(backend, options)?;
        let (uri, basedn, binddn, bindpw, ssl, validate_certificates) = match typed {
            BackendOptions::Ldap(opts) => (
                opts.ldap_url,
                opts.ldap_base_dn,
                opts.ldap_user_dn,
                opts.ldap_user_dn_password.unwrap_or_default(),
                opts.ssl,
                opts.validate_certificates,
            ),
            BackendOptions::Rfc2307(opts) => {
                let uri = match opts.ldap_server {
                    backend::LdapServerKind::Ad => opts.ldap_domain,
                    backend::LdapServerKind::Standalone => opts.ldap_url,
                };
                (
                    uri.ok_or_else(|| {
                        Error::Configuration(
                            "RFC2307 backend requires an LDAP server location".to_string(),
                        )
                    })?,
                    opts.bind_path_user.unwrap_or_default(),
                    opts.ldap_user_dn,
                    opts.ldap_user_dn_password.unwrap_or_default(),
                    opts.ssl,
                    opts.validate_certificates,
                )
            }
            other => {
                return Err(Error::Configuration(format!(
                    "{}: invalid idmap backend",
                    other.backend()
                )))
            }
        };

        let scheme = if ssl == SslMode::On { "ldaps://" } else { "ldap://" };
        Ok(LdapClientConfig {
            uri_list: vec![format!("{scheme}{uri}")],
            basedn,
            bind_type: "PLAIN".to_string(),
            credentials: LdapBindCredentials {
                binddn,
                bindpw,
            },
            security: LdapSecurity {
                ssl: ssl.as_str().to_string(),
                sasl: "SEAL".to_string(),
                validate_certificates,
            },
        })
    }

    /// Verify a supplied bind secret against the live LDAP server, then
    /// move it to the secret store and strip it from the options map.
    /// Nothing is persisted when the trial connection fails.
    async fn stash_secret(
        &self,
        name: &str,
        backend: IdmapBackend,
        options: &mut BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let secret_domain = if DsType::is_reserved(name) {
            self.directory.workgroup().await?
        } else {
            name.to_string()
        };

        let config = Self::client_config(backend, options)?;
        self.ldap.validate_credentials(&config).await?;

        let secret = options
            .remove(SECRET_OPTION)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        self.secrets.set_secret(&secret_domain, &secret).await?;
        self.secrets.backup().await?;
        Ok(())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a new mapping domain. Aggregates validation violations,
    /// verifies any supplied bind secret before persisting, merges the
    /// backend's defaults under the supplied options, and synchronizes
    /// the daemon configuration.
    pub async fn create(&self, data: DomainCreate) -> Result<MappingDomain> {
        let _guard = self.mutation_lock.lock().await;
        let mut verrors = ValidationErrors::new();
        let mut data = data;

        let existing = self.query(&[]).await?;
        if existing.iter().any(|d| d.name == data.name) {
            verrors.add("idmap_domain_create.name", "Domain names must be unique.");
        }

        if opt_truthy(&data.options, "sssd_compat") {
            let (low, high) = self
                .sssd_range("idmap_domain_create", &data.name, &mut verrors)
                .await?;
            data.range_low = low;
            data.range_high = high;
        }

        let candidate = MappingDomain {
            id: -1,
            name: data.name.clone(),
            dns_domain_name: data.dns_domain_name.clone(),
            range_low: data.range_low,
            range_high: data.range_high,
            idmap_backend: data.idmap_backend,
            options: data.options.clone(),
            certificate_id: data.certificate_id,
        };
        self.validate("idmap_domain_create", &candidate, &existing, &mut verrors)
            .await?;
        backend::validate_options(
            "idmap_domain_create",
            data.idmap_backend,
            &data.options,
            &[OptionCheck::Missing, OptionCheck::Extra],
            &mut verrors,
        );
        if data.certificate_id.is_some() && !options_request_encryption(&data.options) {
            verrors.add(
                "idmap_domain_create.certificate_id",
                format!(
                    "The {} idmap backend does not generate LDAP traffic. \
                     Certificates do not apply.",
                    data.idmap_backend
                ),
            );
        }
        verrors.check()?;

        if opt_str(&data.options, SECRET_OPTION).is_some() {
            self.stash_secret(&data.name, data.idmap_backend, &mut data.options)
                .await?;
        }

        let mut final_options = data.idmap_backend.defaults();
        final_options.extend(data.options);
        data.options = final_options;

        let record = MappingDomain {
            id: 0,
            name: data.name,
            dns_domain_name: data.dns_domain_name,
            range_low: data.range_low,
            range_high: data.range_high,
            idmap_backend: data.idmap_backend,
            options: data.options,
            certificate_id: data.certificate_id,
        };
        let id = self
            .datastore
            .insert(DOMAIN_TABLE, record.to_row()?)
            .await?;
        info!(domain = %record.name, id, "created idmap domain");

        let out = self.get(id).await?;
        self.sync.synchronize(true).await?;
        Ok(out)
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Update a domain by id. Changing the backend discards all prior
    /// options; after persisting, the daemon's mapping cache is cleared
    /// and the call blocks until the clear completes.
    pub async fn update(&self, id: i64, data: DomainUpdate) -> Result<MappingDomain> {
        let _guard = self.mutation_lock.lock().await;
        let old = self.get(id).await?;
        let mut verrors = ValidationErrors::new();

        let mut new = old.clone();
        if let Some(name) = &data.name {
            new.name = name.clone();
        }
        if let Some(dns) = &data.dns_domain_name {
            new.dns_domain_name = Some(dns.clone());
        }
        if let Some(low) = data.range_low {
            new.range_low = low;
        }
        if let Some(high) = data.range_high {
            new.range_high = high;
        }
        if let Some(certificate_id) = data.certificate_id {
            new.certificate_id = Some(certificate_id);
        }
        if let Some(backend) = data.idmap_backend {
            new.idmap_backend = backend;
        }

        match data.idmap_backend {
            // Options from the previous backend are almost certainly not
            // valid for the new one
            Some(backend) if backend != old.idmap_backend => {
                new.options = data.options.clone().unwrap_or_default();
            }
            _ => {
                let mut merged = old.options.clone();
                merged.extend(data.options.clone().unwrap_or_default());
                new.options = merged;
            }
        }

        if old.is_system_domain() && new.name != old.name {
            verrors.add(
                "idmap_domain_update.name",
                format!(
                    "Changing name of default domain {} is not permitted",
                    old.name
                ),
            );
        }

        if opt_truthy(&new.options, "sssd_compat") && !opt_truthy(&old.options, "sssd_compat") {
            let (low, high) = self
                .sssd_range("idmap_domain_update", &new.name, &mut verrors)
                .await?;
            new.range_low = low;
            new.range_high = high;
        }

        if new.idmap_backend == IdmapBackend::Autorid
            && new.name != DsType::ActiveDirectory.name()
        {
            verrors.add(
                "idmap_domain_update.idmap_backend",
                "AUTORID is only permitted for the default idmap backend for the \
                 active directory directory service (DS_TYPE_ACTIVEDIRECTORY).",
            );
        }

        let existing = self.query(&[]).await?;
        self.validate("idmap_domain_update", &new, &existing, &mut verrors)
            .await?;
        backend::validate_options(
            "idmap_domain_update",
            new.idmap_backend,
            &new.options,
            &[OptionCheck::Missing],
            &mut verrors,
        );
        if let Some(patch_options) = &data.options {
            if !patch_options.is_empty() {
                backend::validate_options(
                    "idmap_domain_update",
                    new.idmap_backend,
                    patch_options,
                    &[OptionCheck::Extra],
                    &mut verrors,
                );
            }
        }
        if data.certificate_id.is_some() && !options_request_encryption(&new.options) {
            verrors.add(
                "idmap_domain_update.certificate_id",
                format!(
                    "The {} idmap backend does not generate LDAP traffic. \
                     Certificates do not apply.",
                    new.idmap_backend
                ),
            );
        }
        verrors.check()?;

        backend::prune_keys(new.idmap_backend, &mut new.options);
        let mut final_options = new.idmap_backend.defaults();
        final_options.extend(std::mem::take(&mut new.options));
        new.options = final_options;

        // A secret can only be present here when the caller supplied a new
        // one; stored records never retain it
        if opt_str(&new.options, SECRET_OPTION).is_some() {
            let name = new.name.clone();
            let backend = new.idmap_backend;
            self.stash_secret(&name, backend, &mut new.options).await?;
        }

        self.datastore
            .update(DOMAIN_TABLE, id, new.to_row()?)
            .await?;
        info!(domain = %new.name, id, "updated idmap domain");

        let out = self.get(id).await?;
        self.sync.synchronize(false).await?;
        // The daemon caches mappings that may now be stale; the clear must
        // complete before returning
        self.sync.clear_cache().await?;
        Ok(out)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a domain by id. Deletion of reserved system domains is not
    /// permitted.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        let entry = self.get(id).await?;
        if DsType::is_reserved(&entry.name) {
            return Err(Error::PermissionDenied(format!(
                "Deleting system idmap domain [{}] is not permitted.",
                entry.name
            )));
        }

        self.datastore.delete(DOMAIN_TABLE, id).await?;
        info!(domain = %entry.name, id, "deleted idmap domain");
        self.sync.synchronize(true).await?;
        Ok(())
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Seed the reserved system domains when absent. The appliance ships
    /// with three: the AD and LDAP service domains and the default domain
    /// covering everything else.
    pub async fn bootstrap_system_domains(&self) -> Result<()> {
        let seeds = [
            (
                DsType::ActiveDirectory,
                IdmapBackend::Rid,
                100_000_001u32,
                200_000_000u32,
            ),
            (DsType::Ldap, IdmapBackend::Ldap, 10_000, 90_000_000),
            (
                DsType::DefaultDomain,
                IdmapBackend::Tdb,
                90_000_001,
                100_000_000,
            ),
        ];

        for (kind, backend, range_low, range_high) in seeds {
            if self.get_by_name(kind.name()).await?.is_some() {
                continue;
            }
            let record = MappingDomain {
                id: 0,
                name: kind.name().to_string(),
                dns_domain_name: None,
                range_low,
                range_high,
                idmap_backend: backend,
                options: backend.defaults(),
                certificate_id: None,
            };
            self.datastore
                .insert(DOMAIN_TABLE, record.to_row()?)
                .await?;
            debug!(domain = kind.name(), "seeded system idmap domain");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::loopback::LoopbackDaemon;
    use crate::domain::ports::DaemonDomainInfo;
    use crate::persistence::{MemoryCacheTable, MemoryDatastore, MemorySecretStore};
    use crate::services::{
        MemoryAccountRegistry, MemoryDaemonRegistry, StaticCertificateStore,
        StaticDirectoryServices, StaticLdapClient,
    };
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Harness {
        store: Arc<DomainStore>,
        directory: Arc<StaticDirectoryServices>,
        certificates: Arc<StaticCertificateStore>,
        secrets: Arc<MemorySecretStore>,
        ldap: Arc<StaticLdapClient>,
        daemon: Arc<LoopbackDaemon>,
        registry: Arc<MemoryDaemonRegistry>,
    }

    async fn harness() -> Harness {
        harness_with(true).await
    }

    async fn harness_with(bootstrap: bool) -> Harness {
        let datastore = Arc::new(MemoryDatastore::new());
        let directory = Arc::new(StaticDirectoryServices::new("TESTWG"));
        let certificates = Arc::new(StaticCertificateStore::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let ldap = Arc::new(StaticLdapClient::new());
        let daemon = LoopbackDaemon::started();
        let registry = Arc::new(MemoryDaemonRegistry::new());
        let accounts = Arc::new(MemoryAccountRegistry::new());

        let session = ClientSession::new(
            daemon.clone(),
            daemon.service_control(),
            accounts,
        );
        let sync = CacheSynchronizer::new(
            datastore.clone(),
            directory.clone(),
            registry.clone(),
            daemon.service_control(),
            Arc::new(MemoryCacheTable::new()),
            Arc::new(MemoryCacheTable::new()),
        );
        let store = DomainStore::new(
            datastore,
            directory.clone(),
            certificates.clone(),
            secrets.clone(),
            ldap.clone(),
            session,
            sync,
        );
        if bootstrap {
            store.bootstrap_system_domains().await.unwrap();
        }

        Harness {
            store,
            directory,
            certificates,
            secrets,
            ldap,
            daemon,
            registry,
        }
    }

    fn rid_create(name: &str, range_low: u32, range_high: u32) -> DomainCreate {
        DomainCreate {
            name: name.to_string(),
            dns_domain_name: None,
            range_low,
            range_high,
            idmap_backend: IdmapBackend::Rid,
            certificate_id: None,
            options: BTreeMap::new(),
        }
    }

    fn ldap_options(with_password: bool) -> BTreeMap<String, serde_json::Value> {
        let mut options = BTreeMap::new();
        options.insert("ldap_base_dn".to_string(), json!("dc=example,dc=com"));
        options.insert("ldap_user_dn".to_string(), json!("cn=admin,dc=example,dc=com"));
        options.insert("ldap_url".to_string(), json!("ldap.example.com"));
        if with_password {
            options.insert(SECRET_OPTION.to_string(), json!("hunter2"));
        }
        options
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_system_domains() {
        let h = harness().await;
        let domains = h.store.query(&[]).await.unwrap();
        assert_eq!(domains.len(), 3);

        // Idempotent
        h.store.bootstrap_system_domains().await.unwrap();
        assert_eq!(h.store.query(&[]).await.unwrap().len(), 3);

        let default = h
            .store
            .get_by_name("DS_TYPE_DEFAULT_DOMAIN")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(default.idmap_backend, IdmapBackend::Tdb);
        assert_eq!(default.range_low, 90_000_001);
    }

    #[tokio::test]
    async fn test_create_rid_domain_with_defaults() {
        let h = harness().await;
        let created = h
            .store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        assert_eq!(created.range_low, 1_000_000);
        assert_eq!(created.range_high, 1_100_000);
        assert_eq!(created.idmap_backend, IdmapBackend::Rid);
        assert_eq!(created.options["sssd_compat"], json!(false));

        // Synchronization pushed the domain into the daemon registry
        let live = h.registry.snapshot();
        assert_eq!(live["idmap config CORP : backend"], "rid");
        assert_eq!(live["idmap config CORP : range"], "1000000 - 1100000");
    }

    #[tokio::test]
    async fn test_create_rejects_range_overlap_naming_both() {
        let h = harness().await;
        h.store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        let err = h
            .store
            .create(rid_create("SECOND", 1_050_000, 1_150_000))
            .await
            .unwrap_err();

        let verrors = assert_matches!(err, Error::Validation(v) => v);
        let message = format!("{verrors}");
        assert!(message.contains("CORP"));
        assert!(message.contains("1050000-1150000"));
        assert!(message.contains("1000000-1100000"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let h = harness().await;
        h.store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        let err = h
            .store
            .create(rid_create("CORP", 2_000_000, 2_100_000))
            .await
            .unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("unique"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_dns_name() {
        let h = harness().await;
        let mut first = rid_create("CORP", 1_000_000, 1_100_000);
        first.dns_domain_name = Some("corp.example.com".to_string());
        h.store.create(first).await.unwrap();

        let mut second = rid_create("SECOND", 2_000_000, 2_100_000);
        second.dns_domain_name = Some("corp.example.com".to_string());
        let err = h.store.create(second).await.unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("DNS domain names must be unique"));
    }

    #[tokio::test]
    async fn test_create_rejects_inverted_range() {
        let h = harness().await;
        let err = h
            .store
            .create(rid_create("CORP", 1_100_000, 1_000_000))
            .await
            .unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("high range must be greater"));
    }

    #[tokio::test]
    async fn test_update_backend_change_requires_new_options() {
        let h = harness().await;
        let created = h
            .store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        let err = h
            .store
            .update(
                created.id,
                DomainUpdate {
                    idmap_backend: Some(IdmapBackend::Ldap),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        let verrors = assert_matches!(err, Error::Validation(v) => v);
        let attrs: Vec<_> = verrors
            .issues()
            .iter()
            .map(|i| i.attribute.clone())
            .collect();
        for key in ["ldap_base_dn", "ldap_user_dn", "ldap_url"] {
            assert!(
                attrs.contains(&format!("idmap_domain_update.options.{key}")),
                "missing violation for {key}"
            );
        }
    }

    #[tokio::test]
    async fn test_update_merges_options_and_clears_cache() {
        let h = harness().await;
        let created = h
            .store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        let mut options = BTreeMap::new();
        options.insert("sssd_compat".to_string(), json!(false));
        let updated = h
            .store
            .update(
                created.id,
                DomainUpdate {
                    range_low: Some(1_200_000),
                    range_high: Some(1_300_000),
                    options: Some(options),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.range_low, 1_200_000);
        assert_eq!(updated.options["sssd_compat"], json!(false));
        // The forced cache clear flushed the daemon cache exactly once
        assert_eq!(h.registry.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_update_cannot_rename_system_domain() {
        let h = harness().await;
        let default = h
            .store
            .get_by_name("DS_TYPE_DEFAULT_DOMAIN")
            .await
            .unwrap()
            .unwrap();

        let err = h
            .store
            .update(
                default.id,
                DomainUpdate {
                    name: Some("SOMETHING_ELSE".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("not permitted"));
    }

    #[tokio::test]
    async fn test_update_autorid_only_for_ad_system_domain() {
        let h = harness().await;
        let created = h
            .store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        let err = h
            .store
            .update(
                created.id,
                DomainUpdate {
                    idmap_backend: Some(IdmapBackend::Autorid),
                    options: Some(BTreeMap::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("AUTORID is only permitted"));
    }

    #[tokio::test]
    async fn test_delete_reserved_domain_denied() {
        let h = harness().await;
        for name in [
            "DS_TYPE_DEFAULT_DOMAIN",
            "DS_TYPE_ACTIVEDIRECTORY",
            "DS_TYPE_LDAP",
        ] {
            let domain = h.store.get_by_name(name).await.unwrap().unwrap();
            let err = h.store.delete(domain.id).await.unwrap_err();
            assert_matches!(err, Error::PermissionDenied(_));
        }
    }

    #[tokio::test]
    async fn test_delete_removes_domain_and_config() {
        let h = harness().await;
        let created = h
            .store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();
        assert!(h
            .registry
            .snapshot()
            .contains_key("idmap config CORP : backend"));

        h.store.delete(created.id).await.unwrap();
        assert!(h.store.get_by_name("CORP").await.unwrap().is_none());
        assert!(!h
            .registry
            .snapshot()
            .contains_key("idmap config CORP : backend"));
    }

    #[tokio::test]
    async fn test_sssd_compat_requires_healthy_ad() {
        let h = harness().await;
        let mut create = rid_create("CORP", 1_000_000, 1_100_000);
        create
            .options
            .insert("sssd_compat".to_string(), json!(true));

        let before = h.store.query(&[]).await.unwrap().len();
        let err = h.store.create(create).await.unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("SSSD-compatible"));
        // Fail-fast: nothing persisted
        assert_eq!(h.store.query(&[]).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_sssd_compat_derives_range_from_domain_sid() {
        // No system domains seeded: the hash-derived range must not race
        // against their static reservations in this test
        let h = harness_with(false).await;
        h.directory
            .set_activedirectory(DirectoryServiceState::Healthy);
        let sid = "S-1-5-21-3623811015-3361044348-30300820";
        h.daemon.add_domain(DaemonDomainInfo {
            netbios_domain: "CORP".to_string(),
            dns_name: Some("corp.example.com".to_string()),
            sid: sid.to_string(),
            online: true,
        });

        let mut create = rid_create("CORP", 1_000, 2_000);
        create
            .options
            .insert("sssd_compat".to_string(), json!(true));
        let created = h.store.create(create).await.unwrap();

        let expected_low =
            sssd_low_range(sid, &SssdRangeParams::default(), SSSD_HASH_SEED).unwrap();
        assert_eq!(created.range_low, expected_low);
        assert_eq!(created.range_high, expected_low + RANGE_ALLOCATION_SPAN);
    }

    #[tokio::test]
    async fn test_create_ldap_with_secret_verifies_and_strips() {
        let h = harness().await;
        let create = DomainCreate {
            name: "LDAPDOM".to_string(),
            dns_domain_name: None,
            range_low: 1_000_000,
            range_high: 1_100_000,
            idmap_backend: IdmapBackend::Ldap,
            certificate_id: None,
            options: ldap_options(true),
        };
        let created = h.store.create(create).await.unwrap();

        // Secret stripped from the record, stored separately, backed up
        assert!(!created.options.contains_key(SECRET_OPTION));
        assert_eq!(h.secrets.get("LDAPDOM").unwrap().value, "hunter2");
        assert_eq!(h.secrets.backup_count(), 1);

        // The trial connection used the assembled client config
        let validated = h.ldap.validated();
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].uri_list, vec!["ldap://ldap.example.com"]);
        assert_eq!(validated[0].credentials.bindpw, "hunter2");

        // Defaults merged under the provided values
        assert_eq!(created.options["ssl"], json!("OFF"));
        assert_eq!(created.options["validate_certificates"], json!(true));
    }

    #[tokio::test]
    async fn test_create_ldap_rejected_bind_persists_nothing() {
        let h = harness().await;
        h.ldap.set_reject(true);
        let create = DomainCreate {
            name: "LDAPDOM".to_string(),
            dns_domain_name: None,
            range_low: 1_000_000,
            range_high: 1_100_000,
            idmap_backend: IdmapBackend::Ldap,
            certificate_id: None,
            options: ldap_options(true),
        };

        let err = h.store.create(create).await.unwrap_err();
        assert_matches!(err, Error::LdapBind(_));
        assert!(h.store.get_by_name("LDAPDOM").await.unwrap().is_none());
        assert!(h.secrets.get("LDAPDOM").is_none());
    }

    #[tokio::test]
    async fn test_certificate_requires_encrypted_transport() {
        let h = harness().await;
        h.certificates.add(7);

        let mut create = DomainCreate {
            name: "LDAPDOM".to_string(),
            dns_domain_name: None,
            range_low: 1_000_000,
            range_high: 1_100_000,
            idmap_backend: IdmapBackend::Ldap,
            certificate_id: Some(7),
            options: ldap_options(false),
        };
        let err = h.store.create(create.clone()).await.unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("Certificates do not apply"));

        create.options.insert("ssl".to_string(), json!("ON"));
        let created = h.store.create(create).await.unwrap();
        assert_eq!(created.certificate_id, Some(7));
    }

    #[tokio::test]
    async fn test_unknown_certificate_rejected() {
        let h = harness().await;
        let mut options = ldap_options(false);
        options.insert("ssl".to_string(), json!("ON"));
        let create = DomainCreate {
            name: "LDAPDOM".to_string(),
            dns_domain_name: None,
            range_low: 1_000_000,
            range_high: 1_100_000,
            idmap_backend: IdmapBackend::Ldap,
            certificate_id: Some(99),
            options,
        };

        let err = h.store.create(create).await.unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("valid certificate"));
    }

    #[tokio::test]
    async fn test_create_rejects_extra_options() {
        let h = harness().await;
        let mut create = rid_create("CORP", 1_000_000, 1_100_000);
        create.options.insert("rangesize".to_string(), json!(100000));

        let err = h.store.create(create).await.unwrap_err();
        let verrors = assert_matches!(err, Error::Validation(v) => v);
        assert!(format!("{verrors}").contains("rangesize"));
    }

    #[tokio::test]
    async fn test_next_range_follows_highest() {
        let h = harness().await;
        let (low, high) = h.store.next_range().await.unwrap();
        assert_eq!(low, 200_000_001);
        assert_eq!(high, 300_000_000);

        h.store
            .create(rid_create("CORP", low, high))
            .await
            .unwrap();
        let (low2, high2) = h.store.next_range().await.unwrap();
        assert_eq!(low2, 300_000_001);
        assert_eq!(high2, 400_000_000);
    }

    #[tokio::test]
    async fn test_ad_backend_overlap_permitted() {
        let h = harness().await;
        h.directory
            .set_activedirectory(DirectoryServiceState::Healthy);

        let ad_create = |name: &str| DomainCreate {
            name: name.to_string(),
            dns_domain_name: None,
            range_low: 1_000_000,
            range_high: 1_100_000,
            idmap_backend: IdmapBackend::Ad,
            certificate_id: None,
            options: BTreeMap::new(),
        };
        h.store.create(ad_create("FIRST")).await.unwrap();
        // Same range, AD backend on both sides: permitted
        h.store.create(ad_create("SECOND")).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_extended_attaches_domain_info() {
        let h = harness().await;
        h.daemon.add_domain(DaemonDomainInfo {
            netbios_domain: "CORP".to_string(),
            dns_name: None,
            sid: "S-1-5-21-1-2-3".to_string(),
            online: true,
        });
        h.store
            .create(rid_create("CORP", 1_000_000, 1_100_000))
            .await
            .unwrap();

        let entries = h
            .store
            .query_extended(&[QueryFilter::eq("name", "CORP")], true)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let info = entries[0].domain_info.as_ref().unwrap();
        assert_eq!(info.sid, "S-1-5-21-1-2-3");
    }
}
