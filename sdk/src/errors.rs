//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the plugin core.
//! All errors implement the `PluginErrorExt` trait which provides a
//! host-presentable hint and indicates whether the failure is recoverable.
//!
//! Expected failure modes (missing plugin, policy denial, rejected artifact)
//! are ordinary `Err` values. Only `Internal` marks a broken invariant.

use std::fmt;
use thiserror::Error;

/// Trait for plugin error extensions
///
/// The hint is safe to show to an end user and never contains artifact
/// contents or key material.
pub trait PluginErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried by the caller (e.g. transient I/O)
    /// or fixed by user action (granting a permission, installing a
    /// dependency). Non-recoverable errors reject the artifact outright.
    fn is_recoverable(&self) -> bool;
}

/// A single offending manifest field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Sub-kind of a dependency failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyFailure {
    Missing,
    Conflict,
    Circular,
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyFailure::Missing => f.write_str("missing"),
            DependencyFailure::Conflict => f.write_str("conflict"),
            DependencyFailure::Circular => f.write_str("circular"),
        }
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main plugin core error type
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already installed: {0}")]
    AlreadyExists(String),

    #[error("Validation failed: {}", join_fields(.0))]
    ValidationFailed(Vec<FieldError>),

    #[error("Dependency {kind}: {detail}")]
    DependencyUnsatisfied {
        kind: DependencyFailure,
        detail: String,
    },

    #[error("Permission denied for {plugin_id}: {}", .permissions.join(", "))]
    PermissionDenied {
        plugin_id: String,
        permissions: Vec<String>,
    },

    #[error("Security rejected: {0}")]
    SecurityRejected(String),

    #[error("Signature invalid: {}", .0.join("; "))]
    SignatureInvalid(Vec<String>),

    #[error("Illegal state transition: {from} -> {to}")]
    IllegalStateTransition { from: String, to: String },

    #[error("No update available for {0}")]
    NoUpdateAvailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Shorthand for a single-field validation failure
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        PluginError::ValidationFailed(vec![FieldError::new(field, message)])
    }

    pub fn not_installed(plugin_id: &str) -> Self {
        PluginError::NotFound(format!("plugin '{}' is not installed", plugin_id))
    }
}

impl PluginErrorExt for PluginError {
    fn user_hint(&self) -> &str {
        match self {
            Self::NotFound(_) => "The plugin or dependency could not be found",
            Self::AlreadyExists(_) => "This plugin is already installed",
            Self::ValidationFailed(_) => "The plugin manifest is invalid. Contact the plugin author",
            Self::DependencyUnsatisfied { kind, .. } => match kind {
                DependencyFailure::Missing => "Install the missing dependencies first",
                DependencyFailure::Conflict => "Another installed plugin needs a different version",
                DependencyFailure::Circular => "The plugin has circular dependencies",
            },
            Self::PermissionDenied { .. } => "Grant the requested permissions to continue",
            Self::SecurityRejected(_) => "The plugin was rejected by the security scan",
            Self::SignatureInvalid(_) => "Security verification failed. File may be tampered",
            Self::IllegalStateTransition { .. } => "This action is not possible right now",
            Self::NoUpdateAvailable(_) => "The plugin is already up to date",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Internal(_) => "An internal error occurred. Please report this issue",
            Self::Io(_) => "Reading the plugin failed. Try again",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::SecurityRejected(_) | Self::SignatureInvalid(_) | Self::Internal(_) => false,
            Self::DependencyUnsatisfied {
                kind: DependencyFailure::Circular,
                ..
            } => false,
            _ => true,
        }
    }
}
