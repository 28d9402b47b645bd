//! Error types for the idmap middleware
//!
//! Provides structured error types for all middleware components including
//! domain validation, the mapping-daemon client, cache synchronization, and
//! the persistence ports.

use std::fmt;
use thiserror::Error;

/// Unified error type for the middleware
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    // =========================================================================
    // Permission Errors
    // =========================================================================
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    // =========================================================================
    // Mapping Daemon Errors
    // =========================================================================
    #[error("Mapping daemon unavailable: {service}")]
    DaemonUnavailable { service: String },

    #[error("Mapping daemon error [{code}]: {message}")]
    DaemonProtocol { code: u32, message: String },

    #[error("Timed out waiting for {operation}")]
    DaemonTimeout { operation: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Datastore operation failed: {0}")]
    Datastore(String),

    #[error("Secret store operation failed: {0}")]
    SecretStore(String),

    #[error("Cache table operation failed: {0}")]
    CacheTable(String),

    #[error("LDAP bind failed: {0}")]
    LdapBind(String),

    #[error("Service control failed: {service} - {reason}")]
    ServiceControl { service: String, reason: String },

    // =========================================================================
    // Parse/IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error may succeed on a retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DaemonUnavailable { .. }
                | Error::DaemonTimeout { .. }
                | Error::ServiceControl { .. }
        )
    }

    /// Check if this error is transient daemon unavailability, the one
    /// condition the client session auto-recovers from
    pub fn is_daemon_unavailable(&self) -> bool {
        matches!(self, Error::DaemonUnavailable { .. })
    }

    /// The daemon-provided error code, when one was attached
    pub fn daemon_code(&self) -> Option<u32> {
        match self {
            Error::DaemonProtocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for the middleware
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Aggregated Validation
// =============================================================================

/// A single validation violation, attributed to the request field that
/// caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path of the offending attribute, e.g. `idmap_domain_create.range_low`
    pub attribute: String,
    /// Human-readable description of the violation
    pub message: String,
}

/// Collector for validation violations.
///
/// Structural checks never abort on the first violation; they accumulate
/// into this collector and the caller decides when to stop with [`check`].
///
/// [`check`]: ValidationErrors::check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation against an attribute
    pub fn add(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            attribute: attribute.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Fail with all accumulated violations, or continue if there are none
    pub fn check(&self) -> Result<()> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self.clone()))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{}] {}", issue.attribute, issue.message)?;
        }
        Ok(())
    }
}
