//! Plugin lifecycle orchestration
//!
//! `PluginManager` is the context object a host constructs once and shares
//! (usually behind an `Arc`). It owns the plugin records and drives every
//! structural operation through the validation pipeline:
//!
//! 1. manifest parsing (the manifest id must match the requested id)
//! 2. artifact trust validation
//! 3. signature verification
//! 4. dependency resolution
//! 5. permission validation
//!
//! The first failing stage aborts the operation and nothing is written.
//! Dependencies staged with `stage_available` are vetted the same way and
//! committed in resolver order before the target.
//!
//! # Concurrency
//!
//! Structural operations are serialized per plugin id with an async mutex
//! per id; distinct ids proceed concurrently. Records live in a sharded map
//! and no map guard is held across an await.

pub mod recovery;
pub mod runtime;

pub use recovery::{
    DisableStrategy, RecoveryOutcome, RecoveryStrategy, RestartStrategy, RuntimeFailure,
};
pub use runtime::ModuleHost;

use chrono::Utc;
use dashmap::DashMap;
use sdk::errors::{DependencyFailure, PluginError};
use sdk::manifest::PluginManifest;
use sdk::types::{LifecycleState, Permission, PluginRecord, RuntimeState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::message_bus::{Event, LifecycleEvent, MessageBus};
use crate::permissions::{PermissionAuthority, PermissionGrant, PermissionStatistics};
use crate::resolver::{self, DependencyResolutionResult, DependencyResolver};
use crate::signature::{self, SignatureVerifier};
use crate::trust::ArtifactValidator;
use crate::version;

/// Lifecycle events retained for `lifecycle_history`
const HISTORY_CAPACITY: usize = 500;

/// Raw plugin package as supplied by the host
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub plugin_id: String,
    pub manifest: Vec<u8>,
    /// Artifact bytes, optionally carrying a signature block
    pub artifact: Vec<u8>,
    pub source_url: Option<String>,
}

impl PluginPackage {
    pub fn new(plugin_id: impl Into<String>, manifest: Vec<u8>, artifact: Vec<u8>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            manifest,
            artifact,
            source_url: None,
        }
    }

    pub fn with_source(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = Some(source_url.into());
        self
    }
}

/// Snapshot of one installed plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub record: PluginRecord,
    pub manifest: PluginManifest,
    pub runtime_state: RuntimeState,
    pub pending_update: Option<String>,
    pub granted_permissions: BTreeSet<Permission>,
    /// Installed plugins that require this one
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStatistics {
    pub total_plugins: usize,
    pub by_state: BTreeMap<String, usize>,
    pub total_installed_bytes: u64,
    pub running_modules: usize,
    pub staged_packages: usize,
    pub permissions: PermissionStatistics,
}

/// Outcome of a successful install or update
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub plugin_id: String,
    pub version: String,
    /// Plugins written by this operation, dependencies first
    pub installed: Vec<String>,
    pub warnings: Vec<String>,
}

/// Outcome of an uninstall; uninstall never fails
#[derive(Debug, Clone, Default, Serialize)]
pub struct UninstallReport {
    pub plugin_id: String,
    pub was_installed: bool,
    pub previous_state: Option<LifecycleState>,
    pub revoked_permissions: usize,
    pub freed_bytes: u64,
    pub warnings: Vec<String>,
}

struct PluginEntry {
    record: PluginRecord,
    manifest: PluginManifest,
    runtime: RuntimeState,
    pending_update: Option<String>,
    state_before_update: Option<LifecycleState>,
}

struct StagedPackage {
    package: PluginPackage,
    record: PluginRecord,
}

/// Package that passed manifest, trust and signature checks
struct VettedPackage {
    manifest: PluginManifest,
    record: PluginRecord,
    warnings: Vec<String>,
}

/// Plugin trust and lifecycle context
pub struct PluginManager {
    records: DashMap<String, PluginEntry>,
    staged: DashMap<String, StagedPackage>,
    op_locks: DashMap<String, Arc<Mutex<()>>>,
    validator: Arc<ArtifactValidator>,
    verifier: Arc<SignatureVerifier>,
    permissions: Arc<PermissionAuthority>,
    resolver: DependencyResolver,
    bus: Arc<MessageBus>,
    host: Option<Arc<dyn ModuleHost>>,
    recovery: Vec<Arc<dyn RecoveryStrategy>>,
    history: StdMutex<VecDeque<LifecycleEvent>>,
}

impl PluginManager {
    /// Create a manager from its components
    ///
    /// The default recovery list is a bounded `RestartStrategy` followed by
    /// `DisableStrategy`.
    pub fn new(
        validator: Arc<ArtifactValidator>,
        verifier: Arc<SignatureVerifier>,
        permissions: Arc<PermissionAuthority>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            records: DashMap::new(),
            staged: DashMap::new(),
            op_locks: DashMap::new(),
            validator,
            verifier,
            permissions,
            resolver: DependencyResolver::new(),
            bus,
            host: None,
            recovery: vec![
                Arc::new(RestartStrategy::default()),
                Arc::new(DisableStrategy),
            ],
            history: StdMutex::new(VecDeque::new()),
        }
    }

    /// Build every component from configuration
    pub fn from_config(config: &Config) -> Result<Self, PluginError> {
        let bus = Arc::new(MessageBus::new());
        let validator = Arc::new(ArtifactValidator::new(config.validator_config())?);
        let verifier = Arc::new(config.build_signature_verifier()?);
        let permissions = Arc::new(
            config
                .build_permission_authority()?
                .with_bus(Arc::clone(&bus)),
        );
        Ok(Self::new(validator, verifier, permissions, bus))
    }

    pub fn with_module_host(mut self, host: Arc<dyn ModuleHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Replace the recovery strategy list; order is significant
    pub fn with_recovery_strategies(mut self, strategies: Vec<Arc<dyn RecoveryStrategy>>) -> Self {
        self.recovery = strategies;
        self
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn permissions(&self) -> &Arc<PermissionAuthority> {
        &self.permissions
    }

    pub fn validator(&self) -> &Arc<ArtifactValidator> {
        &self.validator
    }

    pub fn verifier(&self) -> &Arc<SignatureVerifier> {
        &self.verifier
    }

    /// Register a dependency package the host has already fetched
    ///
    /// Only the manifest is checked here; trust and signature checks run
    /// when an install pulls the package in.
    pub fn stage_available(&self, package: PluginPackage) -> Result<(), PluginError> {
        let manifest = PluginManifest::from_bytes(&package.manifest)?;
        check_manifest_id(&package.plugin_id, &manifest)?;
        let size = signature::strip_signature(&package.artifact).len() as u64;
        let record = manifest.to_record(size);
        debug!("Staged {}@{}", record.id, record.version);
        self.staged
            .insert(package.plugin_id.clone(), StagedPackage { package, record });
        Ok(())
    }

    pub fn unstage(&self, plugin_id: &str) -> bool {
        self.staged.remove(plugin_id).is_some()
    }

    /// Install a plugin and any staged dependencies it needs
    pub async fn install(
        &self,
        plugin_id: &str,
        manifest: &[u8],
        artifact: &[u8],
        source_url: Option<&str>,
    ) -> Result<InstallReport, PluginError> {
        self.install_package(PluginPackage {
            plugin_id: plugin_id.to_string(),
            manifest: manifest.to_vec(),
            artifact: artifact.to_vec(),
            source_url: source_url.map(str::to_string),
        })
        .await
    }

    pub async fn install_package(&self, package: PluginPackage) -> Result<InstallReport, PluginError> {
        let id = package.plugin_id.clone();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        info!("Installing plugin {}", id);

        if self.records.contains_key(&id) {
            let err = PluginError::AlreadyExists(id.clone());
            self.record_failure(&id, LifecycleState::NotInstalled, &err).await;
            return Err(err);
        }

        match self.run_install(&package).await {
            Ok(report) => {
                info!(
                    "Installed {}@{} ({} packages)",
                    report.plugin_id,
                    report.version,
                    report.installed.len()
                );
                Ok(report)
            }
            Err(err) => {
                self.record_failure(&id, LifecycleState::NotInstalled, &err).await;
                Err(err)
            }
        }
    }

    async fn run_install(&self, package: &PluginPackage) -> Result<InstallReport, PluginError> {
        let target = self.vet_package(package).await?;
        let id = target.record.id.clone();
        let version = target.record.version.clone();

        let installed = self.installed_snapshot();
        let (plan, mut warnings) = self.plan_dependencies(target, &installed).await?;

        let grants = self.snapshot_plan_grants(&plan);
        if let Err(err) = self.validate_plan_permissions(&plan).await {
            self.restore_plan_grants(grants).await;
            return Err(err);
        }

        let dependency_ids: Vec<String> = plan
            .iter()
            .map(|p| p.record.id.clone())
            .filter(|d| d != &id)
            .collect();
        let _dependency_guards = self.lock_all(&dependency_ids).await;

        if let Some(raced) = dependency_ids.iter().find(|d| self.records.contains_key(*d)) {
            let detail = format!("{} was installed concurrently; retry the install", raced);
            self.restore_plan_grants(grants).await;
            return Err(PluginError::DependencyUnsatisfied {
                kind: DependencyFailure::Conflict,
                detail,
            });
        }

        let mut written = Vec::with_capacity(plan.len());
        for vetted in plan {
            warnings.extend(vetted.warnings.iter().cloned());
            written.push(vetted.record.id.clone());
            self.commit_new(vetted).await;
        }

        Ok(InstallReport {
            plugin_id: id,
            version,
            installed: written,
            warnings,
        })
    }

    /// Resolve `target`, vet the staged packages it pulls in, and return
    /// everything to write in order, target last
    async fn plan_dependencies(
        &self,
        target: VettedPackage,
        installed: &HashMap<String, PluginRecord>,
    ) -> Result<(Vec<VettedPackage>, Vec<String>), PluginError> {
        let available = self.available_snapshot();
        let resolution = self
            .resolver
            .resolve(&target.record, installed, &available);

        if let Some(err) = resolution.to_error() {
            return Err(err);
        }

        let order = checked_order(&target.record.id, &resolution)?;
        let mut plan = Vec::new();

        for dependency in order
            .iter()
            .filter(|d| *d != &target.record.id && !installed.contains_key(*d))
        {
            let package = self
                .staged
                .get(dependency)
                .map(|staged| staged.package.clone())
                .ok_or_else(|| {
                    error!(
                        "Resolver ordered {} for {} but no package is staged",
                        dependency, target.record.id
                    );
                    PluginError::Internal(format!(
                        "install order names unstaged dependency {}",
                        dependency
                    ))
                })?;
            plan.push(self.vet_package(&package).await?);
        }

        plan.push(target);
        Ok((plan, resolution.warnings))
    }

    /// Manifest, trust and signature checks for one package
    async fn vet_package(&self, package: &PluginPackage) -> Result<VettedPackage, PluginError> {
        let manifest = PluginManifest::from_bytes(&package.manifest)?;
        check_manifest_id(&package.plugin_id, &manifest)?;

        let payload = signature::strip_signature(&package.artifact);
        let (security, audit) = self.validator.validate_audited(
            &manifest.id,
            payload,
            package.source_url.as_deref(),
        );
        for entry in audit {
            self.bus.publish(Event::Audit(entry)).await;
        }
        if !security.is_valid {
            return Err(PluginError::SecurityRejected(format!(
                "{}: {}",
                manifest.id,
                security.summary()
            )));
        }

        let verification = self.verifier.verify(&manifest.id, &package.artifact);
        if !verification.is_valid {
            return Err(PluginError::SignatureInvalid(verification.errors));
        }

        let mut warnings: Vec<String> = security
            .findings
            .iter()
            .map(|f| format!("{}: {} ({})", manifest.id, f.title, f.evidence))
            .collect();
        warnings.extend(
            verification
                .warnings
                .iter()
                .map(|w| format!("{}: {}", manifest.id, w)),
        );

        let record = manifest.to_record(payload.len() as u64);
        Ok(VettedPackage {
            manifest,
            record,
            warnings,
        })
    }

    fn snapshot_plan_grants(&self, plan: &[VettedPackage]) -> Vec<(String, Vec<PermissionGrant>)> {
        plan.iter()
            .map(|p| (p.record.id.clone(), self.permissions.snapshot_grants(&p.record.id)))
            .collect()
    }

    /// Undo every grant decision made while validating a plan
    async fn restore_plan_grants(&self, snapshot: Vec<(String, Vec<PermissionGrant>)>) {
        for (plugin_id, grants) in snapshot {
            self.permissions.restore_grants(&plugin_id, grants).await;
        }
    }

    /// Validate the permissions of every package in the plan
    ///
    /// Grants are written as the prompt answers; callers restore a snapshot
    /// when the plan is abandoned.
    async fn validate_plan_permissions(&self, plan: &[VettedPackage]) -> Result<(), PluginError> {
        for vetted in plan {
            let requested: Vec<Permission> = vetted.record.permissions.iter().copied().collect();
            if requested.is_empty() {
                continue;
            }
            let validation = self
                .permissions
                .validate_permissions(&vetted.record.id, &requested)
                .await;
            if !validation.is_valid {
                let mut refused: Vec<String> =
                    validation.denied.iter().map(|p| p.to_string()).collect();
                refused.extend(
                    validation
                        .dangerous_combinations
                        .iter()
                        .map(|(a, b)| format!("{} + {}", a, b)),
                );
                return Err(PluginError::PermissionDenied {
                    plugin_id: vetted.record.id.clone(),
                    permissions: refused,
                });
            }
        }
        Ok(())
    }

    async fn commit_new(&self, vetted: VettedPackage) {
        let VettedPackage {
            manifest,
            mut record,
            ..
        } = vetted;
        let id = record.id.clone();
        record.lifecycle_state = LifecycleState::Installed;
        record.installed_at = Some(Utc::now());

        self.records.insert(
            id.clone(),
            PluginEntry {
                record,
                manifest,
                runtime: RuntimeState::Unloaded,
                pending_update: None,
                state_before_update: None,
            },
        );
        self.staged.remove(&id);

        self.emit_state(&id, LifecycleState::NotInstalled, LifecycleState::Installed, None)
            .await;
    }

    /// Enable an installed plugin
    ///
    /// Every permission the manifest declares must still be held.
    pub async fn enable(&self, plugin_id: &str) -> Result<(), PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let (state, permissions) = self
            .records
            .get(plugin_id)
            .map(|e| (e.record.lifecycle_state, e.record.permissions.clone()))
            .ok_or_else(|| PluginError::not_installed(plugin_id))?;

        if state == LifecycleState::Enabled {
            debug!("{} is already enabled", plugin_id);
            return Ok(());
        }

        let missing: Vec<String> = permissions
            .iter()
            .filter(|p| !self.permissions.has_permission(plugin_id, **p))
            .map(|p| p.to_string())
            .collect();
        if !missing.is_empty() {
            let err = PluginError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                permissions: missing,
            };
            self.record_failure(plugin_id, state, &err).await;
            return Err(err);
        }

        self.transition(plugin_id, LifecycleState::Enabled).await?;
        info!("Enabled {}", plugin_id);
        Ok(())
    }

    /// Disable a plugin; permission grants are kept
    pub async fn disable(&self, plugin_id: &str) -> Result<(), PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let state = self
            .lifecycle_state(plugin_id)
            .ok_or_else(|| PluginError::not_installed(plugin_id))?;
        if state == LifecycleState::Disabled {
            return Ok(());
        }

        self.stop_if_active(plugin_id).await;
        self.transition(plugin_id, LifecycleState::Disabled).await?;
        info!("Disabled {}", plugin_id);
        Ok(())
    }

    /// Record that a newer version exists
    pub async fn mark_update_available(
        &self,
        plugin_id: &str,
        new_version: &str,
    ) -> Result<(), PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let (state, current) = self
            .records
            .get(plugin_id)
            .map(|e| (e.record.lifecycle_state, e.record.version.clone()))
            .ok_or_else(|| PluginError::not_installed(plugin_id))?;

        if !version::is_newer(new_version, &current) {
            return Err(PluginError::NoUpdateAvailable(format!(
                "{} {} is not newer than {}",
                plugin_id, new_version, current
            )));
        }

        if let Some(mut entry) = self.records.get_mut(plugin_id) {
            entry.pending_update = Some(new_version.to_string());
            if state != LifecycleState::UpdateAvailable {
                entry.state_before_update = Some(state);
            }
        }
        self.transition(plugin_id, LifecycleState::UpdateAvailable).await?;
        info!("Update {} -> {} available for {}", current, new_version, plugin_id);
        Ok(())
    }

    /// Replace an installed plugin with a newer version
    ///
    /// Runs the full install pipeline against the new package, then checks
    /// that every installed dependent still accepts the new version. A
    /// disabled plugin stays disabled; otherwise it ends enabled.
    pub async fn update(
        &self,
        plugin_id: &str,
        manifest: &[u8],
        artifact: &[u8],
        source_url: Option<&str>,
    ) -> Result<InstallReport, PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let state = self
            .lifecycle_state(plugin_id)
            .ok_or_else(|| PluginError::not_installed(plugin_id))?;

        let package = PluginPackage {
            plugin_id: plugin_id.to_string(),
            manifest: manifest.to_vec(),
            artifact: artifact.to_vec(),
            source_url: source_url.map(str::to_string),
        };

        match self.run_update(&package).await {
            Ok(report) => {
                info!("Updated {} to {}", plugin_id, report.version);
                Ok(report)
            }
            Err(err) => {
                self.record_failure(plugin_id, state, &err).await;
                Err(err)
            }
        }
    }

    async fn run_update(&self, package: &PluginPackage) -> Result<InstallReport, PluginError> {
        let id = package.plugin_id.clone();
        let (current_version, pending, before_update, current_state) = self
            .records
            .get(&id)
            .map(|e| {
                (
                    e.record.version.clone(),
                    e.pending_update.clone(),
                    e.state_before_update,
                    e.record.lifecycle_state,
                )
            })
            .ok_or_else(|| PluginError::not_installed(&id))?;

        let target = self.vet_package(package).await?;
        let new_version = target.record.version.clone();

        if !version::is_newer(&new_version, &current_version) {
            return Err(PluginError::NoUpdateAvailable(format!(
                "{} {} is not newer than installed {}",
                id, new_version, current_version
            )));
        }
        if let Some(expected) = pending.as_deref() {
            if expected != new_version {
                warn!(
                    "{} update announced {} but package is {}",
                    id, expected, new_version
                );
            }
        }

        let installed = self.installed_snapshot();
        let broken = resolver::check_reverse_constraints(&id, &new_version, &installed);
        if !broken.is_empty() {
            let detail = broken
                .iter()
                .map(|c| format!("{} requires {} {}", c.required_by, id, c.constraint))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(PluginError::DependencyUnsatisfied {
                kind: DependencyFailure::Conflict,
                detail: format!("{} {} would break: {}", id, new_version, detail),
            });
        }

        let (plan, mut warnings) = self.plan_dependencies(target, &installed).await?;
        let new_permissions = plan
            .iter()
            .find(|p| p.record.id == id)
            .map(|p| p.record.permissions.clone())
            .unwrap_or_default();

        // The installed version keeps its grants unless the update commits
        let grants = self.snapshot_plan_grants(&plan);
        if let Err(err) = self.validate_plan_permissions(&plan).await {
            self.restore_plan_grants(grants).await;
            return Err(err);
        }

        let dependency_ids: Vec<String> = plan
            .iter()
            .map(|p| p.record.id.clone())
            .filter(|d| d != &id)
            .collect();
        let _dependency_guards = self.lock_all(&dependency_ids).await;
        if let Some(raced) = dependency_ids.iter().find(|d| self.records.contains_key(*d)) {
            let detail = format!("{} was installed concurrently; retry the update", raced);
            self.restore_plan_grants(grants).await;
            return Err(PluginError::DependencyUnsatisfied {
                kind: DependencyFailure::Conflict,
                detail,
            });
        }

        self.stop_if_active(&id).await;

        let mut written = Vec::with_capacity(plan.len());
        for vetted in plan {
            warnings.extend(vetted.warnings.iter().cloned());
            written.push(vetted.record.id.clone());
            if vetted.record.id == id {
                self.swap_version(vetted);
            } else {
                self.commit_new(vetted).await;
            }
        }

        for stale in self
            .permissions
            .snapshot_grants(&id)
            .into_iter()
            .filter(|g| !new_permissions.contains(&g.permission))
        {
            self.permissions.revoke_permission(&id, stale.permission).await;
        }

        if current_state != LifecycleState::UpdateAvailable {
            self.transition(&id, LifecycleState::UpdateAvailable).await?;
        }
        let prior = before_update.unwrap_or(current_state);
        let final_state = if prior == LifecycleState::Disabled {
            LifecycleState::Disabled
        } else {
            LifecycleState::Enabled
        };
        self.transition(&id, final_state).await?;

        if let Some(mut entry) = self.records.get_mut(&id) {
            entry.pending_update = None;
            entry.state_before_update = None;
        }

        Ok(InstallReport {
            plugin_id: id,
            version: new_version,
            installed: written,
            warnings,
        })
    }

    fn swap_version(&self, vetted: VettedPackage) {
        if let Some(mut entry) = self.records.get_mut(&vetted.record.id) {
            let installed_at = entry.record.installed_at;
            let state = entry.record.lifecycle_state;
            entry.record = vetted.record;
            entry.record.installed_at = installed_at;
            entry.record.lifecycle_state = state;
            entry.manifest = vetted.manifest;
        }
    }

    /// Remove a plugin and everything attached to it
    ///
    /// Tolerates partially inconsistent state: grants are revoked and staged
    /// packages dropped even when no record exists.
    pub async fn uninstall(&self, plugin_id: &str) -> UninstallReport {
        let lock = self.op_lock(plugin_id);
        let guard = lock.lock().await;

        let mut report = UninstallReport {
            plugin_id: plugin_id.to_string(),
            ..UninstallReport::default()
        };

        self.stop_if_active(plugin_id).await;

        match self.records.remove(plugin_id) {
            Some((_, entry)) => {
                report.was_installed = true;
                report.previous_state = Some(entry.record.lifecycle_state);
                report.freed_bytes = entry.record.size;
            }
            None => {
                report
                    .warnings
                    .push(format!("{} was not installed", plugin_id));
            }
        }

        report.revoked_permissions = self.permissions.revoke_all_permissions(plugin_id).await;
        if self.staged.remove(plugin_id).is_some() {
            report
                .warnings
                .push(format!("dropped staged package for {}", plugin_id));
        }

        let dependents = resolver::find_dependents(plugin_id, &self.installed_snapshot());
        for (dependent, constraint) in dependents {
            warn!(
                "{} still requires {} {} after uninstall",
                dependent, plugin_id, constraint
            );
            report.warnings.push(format!(
                "{} still requires {} {}",
                dependent, plugin_id, constraint
            ));
        }

        drop(guard);
        // Only this call and the map still hold the lock
        self.op_locks
            .remove_if(plugin_id, |_, held| Arc::strong_count(held) <= 2);

        if let Some(previous) = report.previous_state {
            self.emit_state(plugin_id, previous, LifecycleState::Uninstalled, None)
                .await;
            info!(
                "Uninstalled {} ({} bytes, {} grants revoked)",
                plugin_id, report.freed_bytes, report.revoked_permissions
            );
        }

        report
    }

    /// Re-run dependency resolution for an installed plugin against the installed set
    pub fn revalidate(&self, plugin_id: &str) -> Result<DependencyResolutionResult, PluginError> {
        let installed = self.installed_snapshot();
        let record = installed
            .get(plugin_id)
            .ok_or_else(|| PluginError::not_installed(plugin_id))?;
        Ok(self.resolver.resolve(record, &installed, &HashMap::new()))
    }

    pub fn get_plugin_info(&self, plugin_id: &str) -> Option<PluginInfo> {
        let (record, manifest, runtime_state, pending_update) = self.records.get(plugin_id).map(|e| {
            (
                e.record.clone(),
                e.manifest.clone(),
                e.runtime,
                e.pending_update.clone(),
            )
        })?;

        let dependents = resolver::find_dependents(plugin_id, &self.installed_snapshot())
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        Some(PluginInfo {
            record,
            manifest,
            runtime_state,
            pending_update,
            granted_permissions: self.permissions.granted_permissions(plugin_id),
            dependents,
        })
    }

    /// Installed records sorted by id
    pub fn list_plugins(&self) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> =
            self.records.iter().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn get_statistics(&self) -> ManagerStatistics {
        let mut stats = ManagerStatistics {
            staged_packages: self.staged.len(),
            permissions: self.permissions.get_statistics(),
            ..ManagerStatistics::default()
        };

        for entry in self.records.iter() {
            stats.total_plugins += 1;
            stats.total_installed_bytes += entry.record.size;
            *stats
                .by_state
                .entry(entry.record.lifecycle_state.to_string())
                .or_insert(0) += 1;
            if entry.runtime == RuntimeState::Running {
                stats.running_modules += 1;
            }
        }

        stats
    }

    /// Lifecycle events recorded for a plugin, oldest first
    pub fn lifecycle_history(&self, plugin_id: &str) -> Vec<LifecycleEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    fn lifecycle_state(&self, plugin_id: &str) -> Option<LifecycleState> {
        self.records
            .get(plugin_id)
            .map(|e| e.record.lifecycle_state)
    }

    /// Apply a lifecycle transition under the caller's operation lock
    async fn transition(&self, plugin_id: &str, to: LifecycleState) -> Result<(), PluginError> {
        let from = {
            let mut entry = self
                .records
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::not_installed(plugin_id))?;
            let from = entry.record.lifecycle_state;
            if !from.can_transition_to(to) {
                return Err(PluginError::IllegalStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            entry.record.lifecycle_state = to;
            from
        };

        self.emit_state(plugin_id, from, to, None).await;
        Ok(())
    }

    async fn emit_state(
        &self,
        plugin_id: &str,
        old_state: LifecycleState,
        new_state: LifecycleState,
        error: Option<String>,
    ) {
        let event = LifecycleEvent {
            plugin_id: plugin_id.to_string(),
            old_state,
            new_state,
            timestamp: Utc::now(),
            error,
        };

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(event.clone());
            while history.len() > HISTORY_CAPACITY {
                history.pop_front();
            }
        }

        self.bus.publish(Event::StateChanged(event)).await;
    }

    /// Report a failed operation; the state is unchanged
    async fn record_failure(&self, plugin_id: &str, state: LifecycleState, err: &PluginError) {
        match err {
            PluginError::Internal(_) => error!("{} failed: {}", plugin_id, err),
            _ => warn!("{} failed: {}", plugin_id, err),
        }
        self.emit_state(plugin_id, state, state, Some(err.to_string()))
            .await;
    }

    fn op_lock(&self, plugin_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.op_locks
                .entry(plugin_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Lock several ids in ascending order
    async fn lock_all(&self, plugin_ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = plugin_ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.op_lock(id).lock_owned().await);
        }
        guards
    }

    fn installed_snapshot(&self) -> HashMap<String, PluginRecord> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), e.record.clone()))
            .collect()
    }

    fn available_snapshot(&self) -> HashMap<String, PluginRecord> {
        self.staged
            .iter()
            .map(|e| (e.key().clone(), e.record.clone()))
            .collect()
    }
}

fn check_manifest_id(plugin_id: &str, manifest: &PluginManifest) -> Result<(), PluginError> {
    if manifest.id != plugin_id {
        return Err(PluginError::invalid_field(
            "id",
            format!(
                "manifest id '{}' does not match requested id '{}'",
                manifest.id, plugin_id
            ),
        ));
    }
    Ok(())
}

/// Install order with the target last, or an invariant violation
fn checked_order(
    target_id: &str,
    resolution: &DependencyResolutionResult,
) -> Result<Vec<String>, PluginError> {
    match resolution.install_order.last() {
        Some(last) if last == target_id => Ok(resolution.install_order.clone()),
        _ => {
            error!(
                "Resolver order {:?} does not end with {}",
                resolution.install_order, target_id
            );
            Err(PluginError::Internal(format!(
                "install order for {} does not end with the target",
                target_id
            )))
        }
    }
}
