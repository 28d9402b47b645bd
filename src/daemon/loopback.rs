//! Loopback mapping daemon
//!
//! An in-process stand-in for the external mapping daemon, holding its
//! SID/ID tables in memory. Backs standalone operation and the test
//! suite; its service control handle wires daemon run-state to the
//! `idmap` service name so the client session's auto-start policy can be
//! exercised end to end.

use crate::daemon::codes;
use crate::domain::ports::{
    BulkMappingResult, DaemonConnection, DaemonDomainInfo, IdType, IdentityMapping,
    MappingDaemon, ServiceControl, UnixId, UnmappedEntry,
};
use crate::error::{Error, Result};
use crate::idmap::IDMAP_SERVICE;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const SEPARATOR: char = '\\';

fn unix_key(id: UnixId) -> String {
    match id.id_type {
        IdType::Group => format!("GID {}", id.id),
        _ => format!("UID {}", id.id),
    }
}

#[derive(Default)]
struct LoopbackState {
    running: AtomicBool,
    /// Whether starting the `idmap` service brings the daemon back
    start_heals: AtomicBool,
    failed_connects: AtomicUsize,
    by_sid: RwLock<BTreeMap<String, IdentityMapping>>,
    by_unix: RwLock<BTreeMap<(u8, u32), String>>,
    domains: RwLock<Vec<DaemonDomainInfo>>,
    own_domain: RwLock<Option<DaemonDomainInfo>>,
    other_services: RwLock<BTreeSet<String>>,
}

/// In-process [`MappingDaemon`] implementation
pub struct LoopbackDaemon {
    state: Arc<LoopbackState>,
}

impl LoopbackDaemon {
    fn with_running(running: bool) -> Arc<Self> {
        let state = LoopbackState {
            running: AtomicBool::new(running),
            start_heals: AtomicBool::new(true),
            ..Default::default()
        };
        Arc::new(Self {
            state: Arc::new(state),
        })
    }

    /// A daemon that is up and answering
    pub fn started() -> Arc<Self> {
        Self::with_running(true)
    }

    /// A daemon that is down until its service is started
    pub fn stopped() -> Arc<Self> {
        Self::with_running(false)
    }

    /// Register a SID <-> Unix identity pair
    pub fn add_mapping(&self, sid: &str, id_type: IdType, id: u32, name: &str) {
        self.state.by_sid.write().insert(
            sid.to_string(),
            IdentityMapping {
                sid: sid.to_string(),
                id_type,
                id,
                name: Some(name.to_string()),
            },
        );
        let mut by_unix = self.state.by_unix.write();
        match id_type {
            IdType::User => {
                by_unix.insert((1, id), sid.to_string());
            }
            IdType::Group => {
                by_unix.insert((2, id), sid.to_string());
            }
            IdType::Both => {
                by_unix.insert((1, id), sid.to_string());
                by_unix.insert((2, id), sid.to_string());
            }
        }
    }

    pub fn add_domain(&self, info: DaemonDomainInfo) {
        self.state.domains.write().push(info);
    }

    pub fn set_own_domain(&self, info: DaemonDomainInfo) {
        *self.state.own_domain.write() = Some(info);
    }

    pub fn set_running(&self, running: bool) {
        self.state.running.store(running, Ordering::SeqCst);
    }

    /// Disable recovery through service start, to exercise the bounded
    /// retry path
    pub fn set_start_heals(&self, heals: bool) {
        self.state.start_heals.store(heals, Ordering::SeqCst);
    }

    /// How many connection attempts failed with daemon-unavailable
    pub fn failed_connects(&self) -> usize {
        self.state.failed_connects.load(Ordering::SeqCst)
    }

    /// Service control handle that maps the `idmap` service to this
    /// daemon's run-state
    pub fn service_control(&self) -> Arc<dyn ServiceControl> {
        Arc::new(LoopbackServiceControl {
            state: self.state.clone(),
        })
    }
}

#[async_trait]
impl MappingDaemon for LoopbackDaemon {
    async fn connect(&self) -> Result<Arc<dyn DaemonConnection>> {
        if !self.state.running.load(Ordering::SeqCst) {
            self.state.failed_connects.fetch_add(1, Ordering::SeqCst);
            return Err(Error::DaemonUnavailable {
                service: IDMAP_SERVICE.to_string(),
            });
        }
        Ok(Arc::new(LoopbackConnection {
            state: self.state.clone(),
        }))
    }
}

// =============================================================================
// Connection
// =============================================================================

struct LoopbackConnection {
    state: Arc<LoopbackState>,
}

#[async_trait]
impl DaemonConnection for LoopbackConnection {
    async fn name_to_sid(&self, name: &str) -> Result<Option<IdentityMapping>> {
        Ok(self
            .state
            .by_sid
            .read()
            .values()
            .find(|entry| entry.name.as_deref() == Some(name))
            .cloned())
    }

    async fn sid_to_name(&self, sid: &str) -> Result<Option<IdentityMapping>> {
        Ok(self.state.by_sid.read().get(sid).cloned())
    }

    async fn sids_to_unix_ids(&self, sids: &[String]) -> Result<BulkMappingResult> {
        let by_sid = self.state.by_sid.read();
        let mut result = BulkMappingResult::default();
        for sid in sids {
            match by_sid.get(sid) {
                Some(entry) => {
                    result.mapped.insert(sid.clone(), entry.clone());
                }
                None => {
                    result.unmapped.insert(
                        sid.clone(),
                        UnmappedEntry {
                            sid: Some(sid.clone()),
                            ..Default::default()
                        },
                    );
                }
            }
        }
        Ok(result)
    }

    async fn unix_ids_to_sids(&self, ids: &[UnixId]) -> Result<BulkMappingResult> {
        let by_unix = self.state.by_unix.read();
        let by_sid = self.state.by_sid.read();
        let mut result = BulkMappingResult::default();
        for id in ids {
            let code = match id.id_type {
                IdType::Group => 2,
                _ => 1,
            };
            let key = unix_key(*id);
            match by_unix.get(&(code, id.id)).and_then(|sid| by_sid.get(sid)) {
                Some(entry) => {
                    result.mapped.insert(key, entry.clone());
                }
                None => {
                    result.unmapped.insert(
                        key,
                        UnmappedEntry {
                            id_type: Some(id.id_type),
                            id: Some(id.id),
                            sid: None,
                        },
                    );
                }
            }
        }
        Ok(result)
    }

    async fn unix_id_to_sid(&self, id: UnixId) -> Result<Option<IdentityMapping>> {
        let code = match id.id_type {
            IdType::Group => 2,
            _ => 1,
        };
        let by_unix = self.state.by_unix.read();
        Ok(by_unix
            .get(&(code, id.id))
            .and_then(|sid| self.state.by_sid.read().get(sid).cloned()))
    }

    async fn domain_info(&self, domain: Option<&str>) -> Result<DaemonDomainInfo> {
        match domain {
            None => self.state.own_domain.read().clone().ok_or_else(|| {
                Error::DaemonProtocol {
                    code: codes::WBC_ERR_DOMAIN_NOT_FOUND,
                    message: "daemon is not joined to a domain".to_string(),
                }
            }),
            Some(name) => self
                .state
                .domains
                .read()
                .iter()
                .find(|d| d.netbios_domain == name)
                .cloned()
                .ok_or_else(|| Error::DaemonProtocol {
                    code: codes::WBC_ERR_DOMAIN_NOT_FOUND,
                    message: format!("{name}: domain not found"),
                }),
        }
    }

    async fn all_domains(&self) -> Result<Vec<DaemonDomainInfo>> {
        Ok(self.state.domains.read().clone())
    }

    fn separator(&self) -> char {
        SEPARATOR
    }
}

// =============================================================================
// Service Control
// =============================================================================

struct LoopbackServiceControl {
    state: Arc<LoopbackState>,
}

#[async_trait]
impl ServiceControl for LoopbackServiceControl {
    async fn start(&self, service: &str) -> Result<()> {
        if service == IDMAP_SERVICE {
            if self.state.start_heals.load(Ordering::SeqCst) {
                self.state.running.store(true, Ordering::SeqCst);
            }
        } else {
            self.state.other_services.write().insert(service.to_string());
        }
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        if service == IDMAP_SERVICE {
            self.state.running.store(false, Ordering::SeqCst);
        } else {
            self.state.other_services.write().remove(service);
        }
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        self.stop(service).await?;
        self.start(service).await
    }

    async fn started(&self, service: &str) -> Result<bool> {
        if service == IDMAP_SERVICE {
            Ok(self.state.running.load(Ordering::SeqCst))
        } else {
            Ok(self.state.other_services.read().contains(service))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_gated_on_run_state() {
        let daemon = LoopbackDaemon::stopped();
        assert!(daemon.connect().await.is_err());
        assert_eq!(daemon.failed_connects(), 1);

        daemon.set_running(true);
        assert!(daemon.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_service_control_drives_daemon() {
        let daemon = LoopbackDaemon::stopped();
        let control = daemon.service_control();

        control.start("idmap").await.unwrap();
        assert!(daemon.connect().await.is_ok());
        assert!(control.started("idmap").await.unwrap());

        control.stop("idmap").await.unwrap();
        assert!(daemon.connect().await.is_err());

        // Other services are tracked independently
        control.start("cifs").await.unwrap();
        assert!(control.started("cifs").await.unwrap());
    }

    #[tokio::test]
    async fn test_both_type_mapping_visible_as_user_and_group() {
        let daemon = LoopbackDaemon::started();
        daemon.add_mapping("S-1-5-21-1-2-3-1103", IdType::Both, 100_500, "CORP\\shared");

        let conn = daemon.connect().await.unwrap();
        for id_type in [IdType::User, IdType::Group] {
            let entry = conn
                .unix_id_to_sid(UnixId {
                    id_type,
                    id: 100_500,
                })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.sid, "S-1-5-21-1-2-3-1103");
        }
    }

    #[tokio::test]
    async fn test_unknown_domain_info_carries_code() {
        let daemon = LoopbackDaemon::started();
        let conn = daemon.connect().await.unwrap();
        let err = conn.domain_info(Some("NOPE")).await.unwrap_err();
        assert_eq!(err.daemon_code(), Some(codes::WBC_ERR_DOMAIN_NOT_FOUND));
    }
}
