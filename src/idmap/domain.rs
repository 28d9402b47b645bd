//! Mapping-domain records
//!
//! The persisted representation of one identity-mapping authority, its
//! reserved system kinds, and the canonical case conversions between the
//! stored row form (lowercase enums) and the API form (uppercase enums).

use crate::error::{Error, Result};
use crate::idmap::backend::IdmapBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Datastore table holding mapping-domain rows
pub const DOMAIN_TABLE: &str = "directoryservice_idmap_domain";

/// Options keys whose values are enum strings stored lowercase
const OPTION_ENUM_KEYS: [&str; 2] = ["ssl", "linked_service"];

// =============================================================================
// Reserved System Domains
// =============================================================================

/// Reserved system domain kinds. Each corresponds to the idmap settings of
/// one directory-service binding; the default domain covers everything not
/// claimed by another authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsType {
    ActiveDirectory,
    Ldap,
    Nis,
    FreeIpa,
    DefaultDomain,
}

impl DsType {
    pub const ALL: [DsType; 5] = [
        DsType::ActiveDirectory,
        DsType::Ldap,
        DsType::Nis,
        DsType::FreeIpa,
        DsType::DefaultDomain,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DsType::ActiveDirectory => "DS_TYPE_ACTIVEDIRECTORY",
            DsType::Ldap => "DS_TYPE_LDAP",
            DsType::Nis => "DS_TYPE_NIS",
            DsType::FreeIpa => "DS_TYPE_FREEIPA",
            DsType::DefaultDomain => "DS_TYPE_DEFAULT_DOMAIN",
        }
    }

    pub fn from_name(name: &str) -> Option<DsType> {
        DsType::ALL.iter().find(|d| d.name() == name).copied()
    }

    /// All reserved system domain names
    pub fn choices() -> Vec<&'static str> {
        DsType::ALL.iter().map(|d| d.name()).collect()
    }

    /// Whether a domain name is one of the reserved system kinds
    pub fn is_reserved(name: &str) -> bool {
        DsType::from_name(name).is_some()
    }
}

// =============================================================================
// Mapping Domain Record
// =============================================================================

/// One persisted identity-mapping authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDomain {
    pub id: i64,
    /// Pre-Windows-2000 domain name; unique
    pub name: String,
    /// DNS name of the domain; unique when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    /// Low bound of the UID/GID range this authority covers
    pub range_low: u32,
    /// High bound of the UID/GID range this authority covers
    pub range_high: u32,
    pub idmap_backend: IdmapBackend,
    /// Backend-specific parameters; exactly the backend's required keys
    /// plus a subset of its optional keys
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Reference to the certificate used for encrypted LDAP transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<i64>,
}

impl MappingDomain {
    /// Whether this is one of the reserved system domains
    pub fn is_system_domain(&self) -> bool {
        DsType::is_reserved(&self.name)
    }

    /// Serialize into the stored row form: backend and enum-valued option
    /// keys lowercase
    pub fn to_row(&self) -> Result<serde_json::Value> {
        let mut row = serde_json::to_value(self)?;
        compress_row(&mut row);
        Ok(row)
    }

    /// Deserialize from the stored row form, restoring canonical uppercase
    /// enum values
    pub fn from_row(row: serde_json::Value) -> Result<MappingDomain> {
        let mut row = row;
        extend_row(&mut row);
        serde_json::from_value(row).map_err(Error::from)
    }
}

/// Uppercase the backend and enum-valued option keys of a stored row
pub fn extend_row(row: &mut serde_json::Value) {
    transform_row(row, |s| s.to_uppercase())
}

/// Lowercase the backend and enum-valued option keys for storage
pub fn compress_row(row: &mut serde_json::Value) {
    transform_row(row, |s| s.to_lowercase())
}

fn transform_row(row: &mut serde_json::Value, case: impl Fn(&str) -> String) {
    let Some(obj) = row.as_object_mut() else {
        return;
    };
    if let Some(serde_json::Value::String(backend)) = obj.get_mut("idmap_backend") {
        *backend = case(backend);
    }
    if let Some(serde_json::Value::Object(options)) = obj.get_mut("options") {
        for key in OPTION_ENUM_KEYS {
            if let Some(serde_json::Value::String(v)) = options.get_mut(key) {
                *v = case(v);
            }
        }
    }
}

// =============================================================================
// Create / Update Payloads
// =============================================================================

/// Payload for creating a new mapping domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCreate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    pub range_low: u32,
    pub range_high: u32,
    pub idmap_backend: IdmapBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<i64>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Partial payload for updating an existing mapping domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_low: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_high: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idmap_backend: Option<IdmapBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BTreeMap<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_domain() -> MappingDomain {
        let mut options = BTreeMap::new();
        options.insert("ldap_base_dn".to_string(), serde_json::json!("dc=example,dc=com"));
        options.insert(
            "ldap_user_dn".to_string(),
            serde_json::json!("cn=admin,dc=example,dc=com"),
        );
        options.insert("ldap_url".to_string(), serde_json::json!("ldap.example.com"));
        options.insert("ssl".to_string(), serde_json::json!("ON"));
        options.insert("validate_certificates".to_string(), serde_json::json!(true));

        MappingDomain {
            id: 4,
            name: "EXAMPLE".to_string(),
            dns_domain_name: Some("example.com".to_string()),
            range_low: 200_000_001,
            range_high: 300_000_000,
            idmap_backend: IdmapBackend::Ldap,
            options,
            certificate_id: Some(7),
        }
    }

    #[test]
    fn test_reserved_names() {
        assert!(DsType::is_reserved("DS_TYPE_DEFAULT_DOMAIN"));
        assert!(DsType::is_reserved("DS_TYPE_ACTIVEDIRECTORY"));
        assert!(!DsType::is_reserved("CORP"));
        assert_eq!(DsType::choices().len(), 5);
    }

    #[test]
    fn test_row_round_trip() {
        let domain = sample_domain();
        let row = domain.to_row().unwrap();

        // Stored form is lowercase for the backend and enum options
        assert_eq!(row["idmap_backend"], serde_json::json!("ldap"));
        assert_eq!(row["options"]["ssl"], serde_json::json!("on"));
        // Non-enum option values are untouched
        assert_eq!(
            row["options"]["ldap_url"],
            serde_json::json!("ldap.example.com")
        );

        let restored = MappingDomain::from_row(row).unwrap();
        assert_eq!(restored, domain);
    }

    #[test]
    fn test_compress_of_extend_is_identity() {
        let domain = sample_domain();
        let stored = domain.to_row().unwrap();

        let mut extended = stored.clone();
        extend_row(&mut extended);
        let mut back = extended;
        compress_row(&mut back);

        assert_eq!(back, stored);
    }

    #[test]
    fn test_system_domain_flag() {
        let mut domain = sample_domain();
        assert!(!domain.is_system_domain());
        domain.name = "DS_TYPE_LDAP".to_string();
        assert!(domain.is_system_domain());
    }
}
