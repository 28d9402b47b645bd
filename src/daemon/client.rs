//! Client Session
//!
//! A short-lived connection to the external mapping daemon, constructed
//! per logical operation. Connection acquisition applies the
//! daemon-unavailable retry policy: start the daemon service once, retry
//! once, then surface the error. No-such-mapping results are reported as
//! `None`/unmapped so bulk conversions can report partial success.

use crate::daemon::codes;
use crate::daemon::retry::RetryPolicy;
use crate::domain::ports::{
    AccountRegistry, AccountRegistryRef, BulkMappingResult, DaemonConnection, DaemonDomainInfo,
    IdType, IdentityMapping, MappingDaemon, MappingDaemonRef, ServiceControl, ServiceControlRef,
    UnixId,
};
use crate::error::{Error, Result};
use crate::idmap::builtins::{SID_LOCAL_GROUP_PREFIX, SID_LOCAL_USER_PREFIX};
use crate::idmap::domain::DsType;
use crate::idmap::IDMAP_SERVICE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bounded wait applied to non-critical identity lookups
const IDMAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Online state of one domain known to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainOnlineStatus {
    pub domain: String,
    pub online: bool,
}

/// Session factory over the mapping daemon, service control, and the
/// platform account database
pub struct ClientSession {
    daemon: MappingDaemonRef,
    services: ServiceControlRef,
    accounts: AccountRegistryRef,
    policy: RetryPolicy,
}

impl ClientSession {
    pub fn new(
        daemon: MappingDaemonRef,
        services: ServiceControlRef,
        accounts: AccountRegistryRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            daemon,
            services,
            accounts,
            policy: RetryPolicy::daemon_unavailable(),
        })
    }

    /// Acquire a daemon connection, reviving the daemon once if needed
    async fn connect(&self) -> Result<Arc<dyn DaemonConnection>> {
        let mut attempt = 0;
        loop {
            match self.daemon.connect().await {
                Ok(conn) => return Ok(conn),
                Err(err) if self.policy.should_retry(attempt, &err) => {
                    debug!(error = %err, "mapping daemon unavailable, starting service");
                    self.services.start(IDMAP_SERVICE).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // =========================================================================
    // Name / SID resolution
    // =========================================================================

    pub async fn name_to_sid(&self, name: &str) -> Result<Option<IdentityMapping>> {
        let conn = self.connect().await?;
        conn.name_to_sid(name).await
    }

    pub async fn sid_to_name(&self, sid: &str) -> Result<Option<IdentityMapping>> {
        let conn = self.connect().await?;
        conn.sid_to_name(sid).await
    }

    // =========================================================================
    // Bulk conversion
    // =========================================================================

    /// Bulk conversion of Windows-style SIDs to Unix IDs. A single daemon
    /// round trip; callers must handle partial success.
    pub async fn convert_sids(&self, sids: &[String]) -> Result<BulkMappingResult> {
        if sids.is_empty() {
            return Err(Error::Configuration(
                "List of SIDs to convert must contain at least one entry".to_string(),
            ));
        }
        let conn = self.connect().await?;
        conn.sids_to_unix_ids(sids).await
    }

    /// Bulk conversion of Unix IDs to Windows-style SIDs. A single daemon
    /// round trip; callers must handle partial success.
    pub async fn convert_unix_ids(&self, ids: &[UnixId]) -> Result<BulkMappingResult> {
        if ids.is_empty() {
            return Err(Error::Configuration(
                "List of IDs to convert must contain at least one entry".to_string(),
            ));
        }
        let conn = self.connect().await?;
        conn.unix_ids_to_sids(ids).await
    }

    // =========================================================================
    // Single-identity conversion
    // =========================================================================

    /// Resolve one Unix identity to a SID string. Local accounts without a
    /// daemon mapping synthesize the `S-1-22-…` form the file server uses,
    /// so views over SMB and over this API agree.
    pub async fn unixid_to_sid(&self, id: UnixId) -> Result<Option<String>> {
        let conn = self.connect().await?;
        if let Some(entry) = conn.unix_id_to_sid(id).await? {
            return Ok(Some(entry.sid));
        }

        let local = match id.id_type {
            IdType::User => self.accounts.user_by_uid(id.id).await?,
            _ => self.accounts.group_by_gid(id.id).await?,
        };
        if local.is_some() {
            let prefix = match id.id_type {
                IdType::User => 1,
                _ => 2,
            };
            return Ok(Some(format!("S-1-22-{}-{}", prefix, id.id)));
        }
        Ok(None)
    }

    /// Resolve one SID string to a Unix identity. SIDs carrying the local
    /// prefixes decode without a daemon round trip.
    pub async fn sid_to_unixid(&self, sid: &str) -> Result<Option<IdentityMapping>> {
        if let Some(raw) = sid.strip_prefix(SID_LOCAL_USER_PREFIX) {
            if let Ok(uid) = raw.parse::<u32>() {
                return Ok(Some(IdentityMapping {
                    sid: sid.to_string(),
                    id_type: IdType::User,
                    id: uid,
                    name: None,
                }));
            }
        }
        if let Some(raw) = sid.strip_prefix(SID_LOCAL_GROUP_PREFIX) {
            if let Ok(gid) = raw.parse::<u32>() {
                return Ok(Some(IdentityMapping {
                    sid: sid.to_string(),
                    id_type: IdType::Group,
                    id: gid,
                    name: None,
                }));
            }
        }

        let conn = self.connect().await?;
        conn.sid_to_name(sid).await
    }

    /// Best-effort numeric id to account name. Expiry of the bounded wait
    /// yields `None` rather than an error; display names are not worth
    /// failing a request over.
    pub async fn id_to_name(&self, id: u32, id_type: IdType) -> Result<Option<String>> {
        let lookup = async {
            match id_type {
                IdType::User => self.accounts.user_by_uid(id).await,
                IdType::Group | IdType::Both => self.accounts.group_by_gid(id).await,
            }
        };

        match tokio::time::timeout(IDMAP_TIMEOUT, lookup).await {
            Ok(result) => Ok(result?.map(|account| account.name)),
            Err(_) => {
                debug!(
                    id,
                    id_type = %id_type,
                    "timeout converting id to name; this may indicate a significant networking issue"
                );
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Domain information
    // =========================================================================

    /// Live daemon info for one configured domain, honoring the system
    /// domain aliases
    pub async fn domain_info(&self, domain: &str) -> Result<Option<DaemonDomainInfo>> {
        if domain == DsType::Ldap.name() {
            return Ok(None);
        }

        let conn = self.connect().await?;
        let info = if domain == DsType::ActiveDirectory.name() {
            conn.domain_info(None).await?
        } else if domain == DsType::DefaultDomain.name() {
            conn.domain_info(Some("BUILTIN")).await?
        } else {
            conn.domain_info(Some(domain)).await?
        };
        Ok(Some(info))
    }

    /// All domains the daemon currently knows about. A stopped daemon or
    /// a non-AD configuration yields an empty list; this sits in hot
    /// paths and must not fail them.
    pub async fn known_domains(&self) -> Result<Vec<DaemonDomainInfo>> {
        let conn = match self.daemon.connect().await {
            Ok(conn) => conn,
            Err(err) if err.is_daemon_unavailable() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        match conn.all_domains().await {
            Ok(domains) => Ok(domains),
            Err(Error::DaemonProtocol { code, .. })
                if code == codes::WBC_ERR_INVALID_RESPONSE =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Online status per known domain
    pub async fn online_status(&self) -> Result<Vec<DomainOnlineStatus>> {
        Ok(self
            .known_domains()
            .await?
            .into_iter()
            .map(|info| DomainOnlineStatus {
                domain: info.netbios_domain,
                online: info.online,
            })
            .collect())
    }
}
