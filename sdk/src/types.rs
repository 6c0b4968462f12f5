//! Shared value types for plugin records, permissions and lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Capability a plugin may request
///
/// The wire names are camelCase to match the manifest vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    FileSystem,
    Network,
    Camera,
    Microphone,
    Location,
    Notifications,
    DeviceInfo,
    Clipboard,
    Storage,
    SystemCommands,
    Bluetooth,
}

impl Permission {
    /// Every permission known to the manifest vocabulary
    pub const ALL: [Permission; 11] = [
        Permission::FileSystem,
        Permission::Network,
        Permission::Camera,
        Permission::Microphone,
        Permission::Location,
        Permission::Notifications,
        Permission::DeviceInfo,
        Permission::Clipboard,
        Permission::Storage,
        Permission::SystemCommands,
        Permission::Bluetooth,
    ];

    /// Manifest name of the permission
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::FileSystem => "fileSystem",
            Permission::Network => "network",
            Permission::Camera => "camera",
            Permission::Microphone => "microphone",
            Permission::Location => "location",
            Permission::Notifications => "notifications",
            Permission::DeviceInfo => "deviceInfo",
            Permission::Clipboard => "clipboard",
            Permission::Storage => "storage",
            Permission::SystemCommands => "systemCommands",
            Permission::Bluetooth => "bluetooth",
        }
    }

    /// Whether the permission is dangerous on its own
    pub fn is_dangerous(&self) -> bool {
        matches!(
            self,
            Permission::FileSystem
                | Permission::Camera
                | Permission::Microphone
                | Permission::Location
                | Permission::SystemCommands
        )
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission '{}'", s))
    }
}

/// Default disposition applied to a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    Allow,
    Deny,
    Ask,
}

impl FromStr for PermissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(PermissionPolicy::Allow),
            "deny" => Ok(PermissionPolicy::Deny),
            "ask" => Ok(PermissionPolicy::Ask),
            other => Err(format!("unknown permission policy '{}'", other)),
        }
    }
}

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    NotInstalled,
    Installed,
    Enabled,
    Disabled,
    UpdateAvailable,
    Uninstalled,
}

impl LifecycleState {
    /// Check whether moving from `self` to `to` is a legal transition
    ///
    /// Any state may move to `Uninstalled`; `Uninstalled` is terminal.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Uninstalled, _) => false,
            (_, Uninstalled) => true,
            (NotInstalled, Installed) => true,
            (Installed, Enabled) | (Installed, Disabled) => true,
            (Enabled, Disabled) | (Disabled, Enabled) => true,
            (Installed, UpdateAvailable) | (Enabled, UpdateAvailable) => true,
            (Disabled, UpdateAvailable) => true,
            (UpdateAvailable, Enabled) | (UpdateAvailable, Disabled) => true,
            // Re-validating an update in place keeps the state
            (UpdateAvailable, UpdateAvailable) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::NotInstalled => "not_installed",
            LifecycleState::Installed => "installed",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Disabled => "disabled",
            LifecycleState::UpdateAvailable => "update_available",
            LifecycleState::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

/// Module runtime state for plugins hosted as running modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Initialized,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl RuntimeState {
    /// Transitional states are the ones a failure can interrupt
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            RuntimeState::Loading
                | RuntimeState::Initializing
                | RuntimeState::Starting
                | RuntimeState::Pausing
                | RuntimeState::Stopping
        )
    }

    pub fn can_transition_to(self, to: RuntimeState) -> bool {
        use RuntimeState::*;
        if to == Error {
            return self.is_transitional() || self == Running;
        }
        matches!(
            (self, to),
            (Unloaded, Loading)
                | (Stopped, Loading)
                | (Error, Loading)
                | (Loading, Loaded)
                | (Loaded, Initializing)
                | (Initializing, Initialized)
                | (Initialized, Starting)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Running, Pausing)
                | (Pausing, Paused)
                | (Paused, Starting)
                | (Paused, Running)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Error, Stopped)
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A declared dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub plugin_id: String,
    pub version_constraint: String,
    pub is_required: bool,
}

impl DependencySpec {
    pub fn required(plugin_id: impl Into<String>, version_constraint: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_constraint: version_constraint.into(),
            is_required: true,
        }
    }

    pub fn optional(plugin_id: impl Into<String>, version_constraint: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_constraint: version_constraint.into(),
            is_required: false,
        }
    }
}

/// Installed (or candidate) plugin record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub lifecycle_state: LifecycleState,
    pub installed_at: Option<DateTime<Utc>>,
    /// Artifact size in bytes
    pub size: u64,
    pub permissions: BTreeSet<Permission>,
    pub dependencies: Vec<DependencySpec>,
}

impl PluginRecord {
    /// Create a record that has not been installed yet
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            lifecycle_state: LifecycleState::NotInstalled,
            installed_at: None,
            size: 0,
            permissions: BTreeSet::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    /// Required dependencies only
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|d| d.is_required)
    }
}
