//! Warden SDK
//!
//! Shared value types, the error taxonomy and the manifest parser used by
//! the plugin trust engine and by hosts that embed it.

/// Error types and handling
pub mod errors;

/// Plugin manifest parsing and validation
pub mod manifest;

/// Shared record, permission and state types
pub mod types;

// Re-export commonly used types
pub use errors::{DependencyFailure, FieldError, PluginError, PluginErrorExt};
pub use manifest::{ManifestField, PluginCategory, PluginConfig, PluginManifest};
pub use types::{
    DependencySpec, LifecycleState, Permission, PermissionPolicy, PluginRecord, RuntimeState,
};
