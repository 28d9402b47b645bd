//! Backend Registry
//!
//! Static table of supported mapping-backend kinds. Each kind declares its
//! required and optional parameters with defaults, whether it stores a
//! secret, and which directory services it applies to. The registry is
//! closed: kinds and parameter sets are fixed at compile time.

use crate::domain::ports::DirectoryServiceKind;
use crate::error::{Error, Result, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// =============================================================================
// Backend Kinds
// =============================================================================

/// The supported mapping-backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdmapBackend {
    #[serde(rename = "AD")]
    Ad,
    #[serde(rename = "AUTORID")]
    Autorid,
    #[serde(rename = "LDAP")]
    Ldap,
    #[serde(rename = "NSS")]
    Nss,
    #[serde(rename = "RFC2307")]
    Rfc2307,
    #[serde(rename = "RID")]
    Rid,
    #[serde(rename = "TDB")]
    Tdb,
}

impl IdmapBackend {
    pub const ALL: [IdmapBackend; 7] = [
        IdmapBackend::Ad,
        IdmapBackend::Autorid,
        IdmapBackend::Ldap,
        IdmapBackend::Nss,
        IdmapBackend::Rfc2307,
        IdmapBackend::Rid,
        IdmapBackend::Tdb,
    ];

    /// Canonical uppercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            IdmapBackend::Ad => "AD",
            IdmapBackend::Autorid => "AUTORID",
            IdmapBackend::Ldap => "LDAP",
            IdmapBackend::Nss => "NSS",
            IdmapBackend::Rfc2307 => "RFC2307",
            IdmapBackend::Rid => "RID",
            IdmapBackend::Tdb => "TDB",
        }
    }

    /// Lowercase form used in persisted rows and daemon configuration
    pub fn as_config_value(&self) -> String {
        self.as_str().to_lowercase()
    }

    /// Static descriptor for this backend kind
    pub fn describe(&self) -> &'static BackendDescriptor {
        match self {
            IdmapBackend::Ad => &AD_DESCRIPTOR,
            IdmapBackend::Autorid => &AUTORID_DESCRIPTOR,
            IdmapBackend::Ldap => &LDAP_DESCRIPTOR,
            IdmapBackend::Nss => &NSS_DESCRIPTOR,
            IdmapBackend::Rfc2307 => &RFC2307_DESCRIPTOR,
            IdmapBackend::Rid => &RID_DESCRIPTOR,
            IdmapBackend::Tdb => &TDB_DESCRIPTOR,
        }
    }

    /// Every parameter name this backend accepts
    pub fn supported_keys(&self) -> Vec<&'static str> {
        self.describe().parameters.iter().map(|p| p.key).collect()
    }

    /// Parameter names that must be provided
    pub fn required_keys(&self) -> Vec<&'static str> {
        self.describe()
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.key)
            .collect()
    }

    /// Declared defaults for optional parameters. Parameters with a null
    /// default are omitted.
    pub fn defaults(&self) -> BTreeMap<String, serde_json::Value> {
        self.describe()
            .parameters
            .iter()
            .filter_map(|p| p.default.as_ref().map(|d| (p.key.to_string(), d.to_json())))
            .collect()
    }

    /// Whether this backend's options carry a secret (e.g. a bind password)
    pub fn stores_secret(&self) -> bool {
        self.describe().has_secrets
    }

    /// Directory services this backend applies to
    pub fn services(&self) -> &'static [DirectoryServiceKind] {
        self.describe().services
    }

    /// Valid backend choices per directory service
    pub fn ds_choices() -> BTreeMap<DirectoryServiceKind, Vec<IdmapBackend>> {
        let mut ret: BTreeMap<DirectoryServiceKind, Vec<IdmapBackend>> = BTreeMap::new();
        for kind in [
            DirectoryServiceKind::ActiveDirectory,
            DirectoryServiceKind::Ldap,
        ] {
            ret.insert(
                kind,
                IdmapBackend::ALL
                    .iter()
                    .filter(|b| b.services().contains(&kind))
                    .copied()
                    .collect(),
            );
        }
        ret
    }
}

impl std::fmt::Display for IdmapBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IdmapBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "AD" => Ok(IdmapBackend::Ad),
            "AUTORID" => Ok(IdmapBackend::Autorid),
            "LDAP" => Ok(IdmapBackend::Ldap),
            "NSS" => Ok(IdmapBackend::Nss),
            "RFC2307" => Ok(IdmapBackend::Rfc2307),
            "RID" => Ok(IdmapBackend::Rid),
            "TDB" => Ok(IdmapBackend::Tdb),
            other => Err(Error::Configuration(format!(
                "{other}: invalid idmap backend"
            ))),
        }
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Declared default value of an optional backend parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDefault {
    Bool(bool),
    Int(i64),
    Str(&'static str),
}

impl ParamDefault {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamDefault::Bool(b) => serde_json::Value::Bool(*b),
            ParamDefault::Int(i) => serde_json::Value::from(*i),
            ParamDefault::Str(s) => serde_json::Value::from(*s),
        }
    }
}

/// Declaration of one backend parameter
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub key: &'static str,
    pub required: bool,
    /// `None` means optional with no default, mirroring a null default
    pub default: Option<ParamDefault>,
}

/// Immutable per-kind metadata
#[derive(Debug, Clone, Copy)]
pub struct BackendDescriptor {
    pub description: &'static str,
    pub parameters: &'static [ParamSpec],
    pub has_secrets: bool,
    pub services: &'static [DirectoryServiceKind],
}

const AD_SERVICES: &[DirectoryServiceKind] = &[DirectoryServiceKind::ActiveDirectory];
const AD_LDAP_SERVICES: &[DirectoryServiceKind] = &[
    DirectoryServiceKind::ActiveDirectory,
    DirectoryServiceKind::Ldap,
];

static AD_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Reads id mappings from an Active Directory server that uses \
                  RFC2307/SFU schema extensions.",
    parameters: &[
        ParamSpec {
            key: "schema_mode",
            required: false,
            default: Some(ParamDefault::Str("RFC2307")),
        },
        ParamSpec {
            key: "unix_primary_group",
            required: false,
            default: Some(ParamDefault::Bool(false)),
        },
        ParamSpec {
            key: "unix_nss_info",
            required: false,
            default: Some(ParamDefault::Bool(false)),
        },
    ],
    has_secrets: false,
    services: AD_SERVICES,
};

static AUTORID_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Similar to the RID backend, but automatically configures the \
                  range to be used for each domain in the forest. The only \
                  needed configuration is the range of UID/GIDs to use for \
                  user/group mappings and an optional size for the ranges.",
    parameters: &[
        ParamSpec {
            key: "rangesize",
            required: false,
            default: Some(ParamDefault::Int(100_000)),
        },
        ParamSpec {
            key: "readonly",
            required: false,
            default: Some(ParamDefault::Bool(false)),
        },
        ParamSpec {
            key: "ignore_builtin",
            required: false,
            default: Some(ParamDefault::Bool(false)),
        },
    ],
    has_secrets: false,
    services: AD_SERVICES,
};

static LDAP_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Stores and retrieves mapping tables in an LDAP directory \
                  service. Default for the LDAP directory service.",
    parameters: &[
        ParamSpec {
            key: "ldap_base_dn",
            required: true,
            default: None,
        },
        ParamSpec {
            key: "ldap_user_dn",
            required: true,
            default: None,
        },
        ParamSpec {
            key: "ldap_url",
            required: true,
            default: None,
        },
        ParamSpec {
            key: "ldap_user_dn_password",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "ssl",
            required: false,
            default: Some(ParamDefault::Str("OFF")),
        },
        ParamSpec {
            key: "validate_certificates",
            required: false,
            default: Some(ParamDefault::Bool(true)),
        },
        ParamSpec {
            key: "readonly",
            required: false,
            default: Some(ParamDefault::Bool(false)),
        },
    ],
    has_secrets: true,
    services: AD_LDAP_SERVICES,
};

static NSS_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Ensures that the SID for a Unix user is reported as the one \
                  assigned to the corresponding domain user.",
    parameters: &[ParamSpec {
        key: "linked_service",
        required: false,
        default: Some(ParamDefault::Str("LOCAL_ACCOUNT")),
    }],
    has_secrets: false,
    services: AD_LDAP_SERVICES,
};

static RFC2307_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Looks up IDs in the Active Directory LDAP server or an \
                  external (non-AD) LDAP server. IDs must be stored in RFC2307 \
                  ldap schema extensions.",
    parameters: &[
        ParamSpec {
            key: "ldap_server",
            required: false,
            default: Some(ParamDefault::Str("AD")),
        },
        ParamSpec {
            key: "bind_path_user",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "bind_path_group",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "user_cn",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "cn_realm",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "ldap_domain",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "ldap_url",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "ldap_user_dn",
            required: true,
            default: None,
        },
        ParamSpec {
            key: "ldap_user_dn_password",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "ldap_realm",
            required: false,
            default: None,
        },
        ParamSpec {
            key: "validate_certificates",
            required: false,
            default: Some(ParamDefault::Bool(true)),
        },
        ParamSpec {
            key: "ssl",
            required: false,
            default: Some(ParamDefault::Str("OFF")),
        },
    ],
    has_secrets: true,
    services: AD_LDAP_SERVICES,
};

static RID_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Default for the Active Directory service. Requires an \
                  explicit configuration for each domain, using disjoint \
                  ranges.",
    parameters: &[ParamSpec {
        key: "sssd_compat",
        required: false,
        default: Some(ParamDefault::Bool(false)),
    }],
    has_secrets: false,
    services: AD_SERVICES,
};

static TDB_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    description: "Default backend used to store mapping tables for BUILTIN \
                  and well-known SIDs.",
    parameters: &[ParamSpec {
        key: "readonly",
        required: false,
        default: Some(ParamDefault::Bool(false)),
    }],
    has_secrets: false,
    services: AD_SERVICES,
};

// =============================================================================
// Option Validation
// =============================================================================

/// Which classes of option violations to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionCheck {
    /// Required parameters that were not provided
    Missing,
    /// Provided parameters the backend does not support
    Extra,
}

/// Validate a provided options map against the backend's declared keys,
/// recording violations into `verrors`. Creates check both classes;
/// updates check `Extra` only when the caller supplied an options patch.
pub fn validate_options(
    schema: &str,
    backend: IdmapBackend,
    options: &BTreeMap<String, serde_json::Value>,
    checks: &[OptionCheck],
    verrors: &mut ValidationErrors,
) {
    let supported = backend.supported_keys();
    let required = backend.required_keys();

    if checks.contains(&OptionCheck::Missing) {
        for key in required
            .iter()
            .filter(|k| !options.contains_key(**k))
        {
            verrors.add(
                format!("{schema}.options.{key}"),
                format!("[{key}] is a required parameter for the [{backend}] idmap backend."),
            );
        }
    }

    if checks.contains(&OptionCheck::Extra) {
        for key in options
            .keys()
            .filter(|k| !supported.contains(&k.as_str()))
        {
            verrors.add(
                format!("{schema}.options.{key}"),
                format!("[{key}] is not a valid parameter for the [{backend}] idmap backend."),
            );
        }
    }
}

/// Drop any options key the backend does not support before persisting
pub fn prune_keys(backend: IdmapBackend, options: &mut BTreeMap<String, serde_json::Value>) {
    let supported = backend.supported_keys();
    options.retain(|k, _| supported.contains(&k.as_str()));
}

// =============================================================================
// Typed Option Variants
// =============================================================================

/// Transport encryption modes for LDAP-speaking backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SslMode {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "START_TLS")]
    StartTls,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Off => "OFF",
            SslMode::On => "ON",
            SslMode::StartTls => "START_TLS",
        }
    }

    /// Whether this mode produces encrypted LDAP traffic
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SslMode::Off)
    }
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Off
    }
}

/// Auxiliary directory-service ID provider for the NSS backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkedService {
    #[serde(rename = "LOCAL_ACCOUNT")]
    LocalAccount,
    #[serde(rename = "LDAP")]
    Ldap,
}

impl Default for LinkedService {
    fn default() -> Self {
        LinkedService::LocalAccount
    }
}

/// LDAP server flavor for the RFC2307 backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LdapServerKind {
    #[serde(rename = "AD")]
    Ad,
    #[serde(rename = "STANDALONE")]
    Standalone,
}

impl Default for LdapServerKind {
    fn default() -> Self {
        LdapServerKind::Ad
    }
}

fn default_true() -> bool {
    true
}

fn default_schema_mode() -> String {
    "RFC2307".to_string()
}

fn default_rangesize() -> u32 {
    100_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdOptions {
    #[serde(default = "default_schema_mode")]
    pub schema_mode: String,
    #[serde(default)]
    pub unix_primary_group: bool,
    #[serde(default)]
    pub unix_nss_info: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoridOptions {
    #[serde(default = "default_rangesize")]
    pub rangesize: u32,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub ignore_builtin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdapOptions {
    pub ldap_base_dn: String,
    pub ldap_user_dn: String,
    pub ldap_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_user_dn_password: Option<String>,
    #[serde(default)]
    pub ssl: SslMode,
    #[serde(default = "default_true")]
    pub validate_certificates: bool,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NssOptions {
    #[serde(default)]
    pub linked_service: LinkedService,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rfc2307Options {
    #[serde(default)]
    pub ldap_server: LdapServerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_path_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_path_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cn: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn_realm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_url: Option<String>,
    pub ldap_user_dn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_user_dn_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_realm: Option<bool>,
    #[serde(default = "default_true")]
    pub validate_certificates: bool,
    #[serde(default)]
    pub ssl: SslMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RidOptions {
    #[serde(default)]
    pub sssd_compat: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TdbOptions {
    #[serde(default)]
    pub readonly: bool,
}

/// Backend-specific options as a tagged union. Converted from the open
/// string-keyed map at the validation boundary; each variant carries the
/// strongly-typed option shape of its backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOptions {
    Ad(AdOptions),
    Autorid(AutoridOptions),
    Ldap(LdapOptions),
    Nss(NssOptions),
    Rfc2307(Rfc2307Options),
    Rid(RidOptions),
    Tdb(TdbOptions),
}

impl BackendOptions {
    /// Convert an open options map into the typed variant for `backend`.
    /// Unknown keys must have been pruned or rejected beforehand.
    pub fn from_map(
        backend: IdmapBackend,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self> {
        let value = serde_json::Value::Object(
            options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let parsed = match backend {
            IdmapBackend::Ad => BackendOptions::Ad(serde_json::from_value(value)?),
            IdmapBackend::Autorid => BackendOptions::Autorid(serde_json::from_value(value)?),
            IdmapBackend::Ldap => BackendOptions::Ldap(serde_json::from_value(value)?),
            IdmapBackend::Nss => BackendOptions::Nss(serde_json::from_value(value)?),
            IdmapBackend::Rfc2307 => BackendOptions::Rfc2307(serde_json::from_value(value)?),
            IdmapBackend::Rid => BackendOptions::Rid(serde_json::from_value(value)?),
            IdmapBackend::Tdb => BackendOptions::Tdb(serde_json::from_value(value)?),
        };
        Ok(parsed)
    }

    pub fn backend(&self) -> IdmapBackend {
        match self {
            BackendOptions::Ad(_) => IdmapBackend::Ad,
            BackendOptions::Autorid(_) => IdmapBackend::Autorid,
            BackendOptions::Ldap(_) => IdmapBackend::Ldap,
            BackendOptions::Nss(_) => IdmapBackend::Nss,
            BackendOptions::Rfc2307(_) => IdmapBackend::Rfc2307,
            BackendOptions::Rid(_) => IdmapBackend::Rid,
            BackendOptions::Tdb(_) => IdmapBackend::Tdb,
        }
    }
}
