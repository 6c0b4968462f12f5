//! Warden Engine Library
//!
//! Plugin trust and lifecycle core: artifact scanning, signature
//! verification, permission authorization, dependency resolution and the
//! install/enable/update/uninstall state machine that ties them together.
//! It is used by both the `warden` binary and integration tests.

/// Configuration management module
pub mod config;

/// Message bus for lifecycle, permission and audit events
pub mod message_bus;

/// Version parsing and constraint matching
pub mod version;

/// Dependency resolution
pub mod resolver;

/// Permission authorization and grants
pub mod permissions;

/// Static artifact trust scanning
pub mod trust;

/// Artifact signing and signature verification
pub mod signature;

/// Plugin lifecycle and runtime management
pub mod lifecycle;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

pub use lifecycle::{
    InstallReport, ModuleHost, PluginInfo, PluginManager, PluginPackage, UninstallReport,
};
