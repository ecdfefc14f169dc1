//! Centralized error definitions and helpers for stackconf.
//!
//! This module provides:
//! - One error taxonomy for the whole engine
//! - Helper constructors carrying the failing operation as context
//! - Messages that never contain configuration values
//!
//! Values are never interpolated into messages. Only names, counts, modes
//! and lengths may appear, so an error can be printed or logged without
//! disclosing a secret.

use crate::validation::ValidationError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ConfError>;

/// Errors produced by the configuration engine.
#[derive(Debug, Error)]
pub enum ConfError {
    /// Structural problem in the declared configuration or its files.
    #[error("improperly configured: {reason}")]
    ImproperlyConfigured {
        /// Operation that detected the problem.
        operation: &'static str,
        /// Human readable reason.
        reason: String,
    },

    /// A privileged operation was attempted without the privileged identity.
    #[error("permission denied: {operation} is allowed in root mode only")]
    PermissionDenied {
        /// Operation that was refused.
        operation: &'static str,
    },

    /// No field with this name is declared.
    #[error("no such config: {name}")]
    NoSuchConfig {
        /// Requested name.
        name: String,
    },

    /// The value is absent and the field has no default.
    #[error("config {name} is not set and has no default")]
    ConfigMissing {
        /// Field name.
        name: String,
    },

    /// One or more validators rejected the value.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The raw form is structurally wrong for the field kind.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// Static description of the structural problem.
        reason: String,
    },

    /// The requested service is not registered for this secret.
    #[error("service {service} is not registered for {field}")]
    ServiceNotFound {
        /// Field name.
        field: String,
        /// Service name.
        service: String,
    },

    /// Wrong password or corrupted token. Deliberately indistinguishable.
    #[error("invalid key or token")]
    EncryptionKey,

    /// Filesystem I/O failure.
    #[error("io failure during {operation}")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Ownership or permission syscall failure.
    #[error("syscall failure during {operation}")]
    Nix {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// A user or group name could not be resolved.
    #[error("unknown {kind}: {name}")]
    UnknownOwner {
        /// `user` or `group`.
        kind: &'static str,
        /// Name that failed lookup.
        name: String,
    },

    /// Section manifest could not be parsed.
    #[error("manifest parse failure: {0}")]
    Manifest(#[from] toml::de::Error),

    /// Provisioning failed for one field.
    #[error("{field}: {source}")]
    Provision {
        /// Field whose provisioning failed.
        field: String,
        /// Underlying failure.
        #[source]
        source: Box<ConfError>,
    },
}

impl ConfError {
    /// Whether this error (or the error it wraps) is a validation failure.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::Provision { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// Borrow the aggregate validation error, if any.
    #[must_use]
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Provision { source, .. } => source.validation(),
            _ => None,
        }
    }
}

// ============================================================================
// ERROR CONSTRUCTION HELPERS
// ============================================================================

#[inline]
pub(crate) fn improperly_configured(operation: &'static str, reason: impl Into<String>) -> ConfError {
    ConfError::ImproperlyConfigured {
        operation,
        reason: reason.into(),
    }
}

#[inline]
pub(crate) fn permission_denied(operation: &'static str) -> ConfError {
    ConfError::PermissionDenied { operation }
}

#[inline]
pub(crate) fn no_such_config(name: &str) -> ConfError {
    ConfError::NoSuchConfig {
        name: name.to_owned(),
    }
}

#[inline]
pub(crate) fn config_missing(name: &str) -> ConfError {
    ConfError::ConfigMissing {
        name: name.to_owned(),
    }
}

/// Structural conversion failure. `reason` must not contain the value.
#[inline]
pub(crate) fn invalid_value(reason: impl Into<String>) -> ConfError {
    ConfError::InvalidValue {
        reason: reason.into(),
    }
}

#[inline]
pub(crate) fn service_not_found(field: &str, service: &str) -> ConfError {
    ConfError::ServiceNotFound {
        field: field.to_owned(),
        service: service.to_owned(),
    }
}

/// File I/O failure. The path is kept as structured context only.
#[inline]
pub(crate) fn io_error<P: AsRef<Path>>(
    operation: &'static str,
    path: P,
    source: std::io::Error,
) -> ConfError {
    ConfError::Io {
        operation,
        path: path.as_ref().to_path_buf(),
        source,
    }
}

#[inline]
pub(crate) fn nix_error<P: AsRef<Path>>(
    operation: &'static str,
    path: P,
    source: nix::Error,
) -> ConfError {
    ConfError::Nix {
        operation,
        path: path.as_ref().to_path_buf(),
        source,
    }
}

#[inline]
pub(crate) fn unknown_owner(kind: &'static str, name: &str) -> ConfError {
    ConfError::UnknownOwner {
        kind,
        name: name.to_owned(),
    }
}

/// Attach the field name to a provisioning failure.
#[inline]
pub(crate) fn provision_failed(field: &str, source: ConfError) -> ConfError {
    ConfError::Provision {
        field: field.to_owned(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_error_is_prefixed_with_field_name() {
        let err = provision_failed("DB_PASSWORD", config_missing("DB_PASSWORD"));
        assert!(err.to_string().starts_with("DB_PASSWORD: "));
    }

    #[test]
    fn provision_error_exposes_wrapped_validation() {
        let inner = ConfError::from(ValidationError::new("Too short (3 < 8)"));
        let err = provision_failed("X", inner);
        assert!(err.is_validation());
        assert_eq!(err.validation().map(ValidationError::len), Some(1));
    }

    #[test]
    fn io_error_keeps_path_out_of_message() {
        let err = io_error(
            "read_line_file",
            "/host/.secret.env",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(!err.to_string().contains(".secret.env"));
        match err {
            ConfError::Io { path, .. } => assert_eq!(path, PathBuf::from("/host/.secret.env")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn permission_denied_names_operation() {
        let err = permission_denied("set");
        assert!(err.to_string().contains("set"));
        assert!(err.to_string().contains("root mode"));
    }
}
