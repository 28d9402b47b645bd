//! In-memory secret store
//!
//! Holds directory-service bind secrets keyed by domain, implementing the
//! [`SecretStore`] port. Secrets never appear in persisted domain rows;
//! the domain store strips them before insert.

use crate::domain::ports::SecretStore;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub struct SecretEntry {
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// In-memory [`SecretStore`] implementation
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<BTreeMap<String, SecretEntry>>,
    backups: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored secret, for test assertions
    pub fn get(&self, domain: &str) -> Option<SecretEntry> {
        self.entries.read().get(domain).cloned()
    }

    /// How many times the store was backed up
    pub fn backup_count(&self) -> usize {
        self.backups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn set_secret(&self, domain: &str, value: &str) -> Result<()> {
        self.entries.write().insert(
            domain.to_string(),
            SecretEntry {
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn backup(&self) -> Result<()> {
        self.backups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
