//! Permission authority
//!
//! Decides which capabilities a plugin may exercise. Every request is
//! evaluated against the global policy table:
//!
//! - `Allow`: granted immediately
//! - `Deny`: denied immediately, the prompt is never consulted
//! - `Ask`: the registered `AuthorizationPrompt` decides
//!
//! Grants live in a sharded map keyed by `(plugin_id, permission)`. No lock
//! is held while a prompt is pending, so a slow prompt for one plugin never
//! blocks checks for another. The grant is written only after the prompt
//! answers; an abandoned prompt leaves the store untouched.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sdk::types::{Permission, PermissionPolicy};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::message_bus::{Event, MessageBus};

pub const REASON_AUTO_GRANTED: &str = "auto-granted";
pub const REASON_POLICY_DENIED: &str = "policy denied";
pub const REASON_USER_GRANTED: &str = "user granted";
pub const REASON_USER_DENIED: &str = "user denied";
pub const REASON_NO_CALLBACK: &str = "no authorization callback";

/// Pairs that are dangerous together even when each is acceptable alone
pub const DANGEROUS_COMBINATIONS: [(Permission, Permission); 7] = [
    (Permission::FileSystem, Permission::Network),
    (Permission::Camera, Permission::Network),
    (Permission::Microphone, Permission::Network),
    (Permission::Location, Permission::Network),
    (Permission::SystemCommands, Permission::Network),
    (Permission::Clipboard, Permission::Network),
    (Permission::SystemCommands, Permission::FileSystem),
];

/// Default policy for a permission
pub fn default_policy(permission: Permission) -> PermissionPolicy {
    match permission {
        Permission::Notifications | Permission::DeviceInfo | Permission::Storage => {
            PermissionPolicy::Allow
        }
        _ => PermissionPolicy::Ask,
    }
}

/// Outcome of one authorization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionGrant {
    pub plugin_id: String,
    pub permission: Permission,
    pub granted: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionGrant {
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.granted && self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// What the prompt is asked to decide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub plugin_id: String,
    pub permission: Permission,
    /// Why the plugin wants the permission
    pub reason: String,
}

/// Host-side yes/no decision for `Ask` permissions
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    async fn authorize(&self, request: AuthorizationRequest) -> bool;
}

/// Adapter for async closures
struct FnPrompt<F>(F);

#[async_trait]
impl<F, Fut> AuthorizationPrompt for FnPrompt<F>
where
    F: Fn(AuthorizationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn authorize(&self, request: AuthorizationRequest) -> bool {
        (self.0)(request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PermissionRisk {
    Low,
    Medium,
    High,
}

/// Result of validating a permission set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionValidation {
    pub is_valid: bool,
    pub granted: Vec<Permission>,
    pub denied: Vec<Permission>,
    pub risk_level: PermissionRisk,
    pub dangerous_combinations: Vec<(Permission, Permission)>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionStatistics {
    pub total_grants: usize,
    pub active_grants: usize,
    pub denied_grants: usize,
    pub expired_grants: usize,
    /// Active grants per plugin
    pub by_plugin: BTreeMap<String, usize>,
    /// Active grants per permission
    pub by_permission: BTreeMap<Permission, usize>,
}

/// Pairs from `DANGEROUS_COMBINATIONS` fully contained in `permissions`
pub fn dangerous_combinations(permissions: &BTreeSet<Permission>) -> Vec<(Permission, Permission)> {
    DANGEROUS_COMBINATIONS
        .iter()
        .filter(|(a, b)| permissions.contains(a) && permissions.contains(b))
        .copied()
        .collect()
}

/// Risk classification for a permission set
pub fn classify_risk(permissions: &BTreeSet<Permission>) -> PermissionRisk {
    if !dangerous_combinations(permissions).is_empty() {
        PermissionRisk::High
    } else if permissions.iter().any(Permission::is_dangerous) {
        PermissionRisk::Medium
    } else {
        PermissionRisk::Low
    }
}

/// Policy table, grant store and authorization prompt
pub struct PermissionAuthority {
    policies: DashMap<Permission, PermissionPolicy>,
    grants: DashMap<(String, Permission), PermissionGrant>,
    prompt: RwLock<Option<Arc<dyn AuthorizationPrompt>>>,
    grant_ttl: Option<Duration>,
    bus: Option<Arc<MessageBus>>,
}

impl PermissionAuthority {
    /// Create an authority with the default policy table
    pub fn new() -> Self {
        let policies = DashMap::new();
        for permission in Permission::ALL {
            policies.insert(permission, default_policy(permission));
        }
        Self {
            policies,
            grants: DashMap::new(),
            prompt: RwLock::new(None),
            grant_ttl: None,
            bus: None,
        }
    }

    /// Publish grant, deny and revoke events to `bus`
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Expire user grants after `ttl`
    pub fn with_grant_ttl(mut self, ttl: Duration) -> Self {
        self.grant_ttl = Some(ttl);
        self
    }

    pub fn set_permission_policy(&self, permission: Permission, policy: PermissionPolicy) {
        info!("Policy for {} set to {:?}", permission, policy);
        self.policies.insert(permission, policy);
    }

    pub fn get_policy(&self, permission: Permission) -> PermissionPolicy {
        self.policies
            .get(&permission)
            .map(|p| *p)
            .unwrap_or_else(|| default_policy(permission))
    }

    pub fn set_authorization_prompt(&self, prompt: Arc<dyn AuthorizationPrompt>) {
        *self.prompt.write().unwrap_or_else(|e| e.into_inner()) = Some(prompt);
    }

    /// Register an async closure as the authorization prompt
    pub fn set_user_authorization_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(AuthorizationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.set_authorization_prompt(Arc::new(FnPrompt(callback)));
    }

    pub fn clear_authorization_prompt(&self) {
        *self.prompt.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Decide a single permission request
    ///
    /// Policy is read fresh on every call; an earlier grant is never reused.
    /// Under `Ask` this awaits the prompt, and the calling task stays
    /// pending until the host answers.
    pub async fn request_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        reason: &str,
    ) -> PermissionGrant {
        let policy = self.get_policy(permission);
        debug!(
            "Permission request {} for {} under {:?}",
            permission, plugin_id, policy
        );

        let (granted, decision, expires_at) = match policy {
            PermissionPolicy::Allow => (true, REASON_AUTO_GRANTED, None),
            PermissionPolicy::Deny => (false, REASON_POLICY_DENIED, None),
            PermissionPolicy::Ask => {
                // Clone the handle out so no lock is held across the await
                let prompt = self
                    .prompt
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match prompt {
                    Some(prompt) => {
                        let request = AuthorizationRequest {
                            plugin_id: plugin_id.to_string(),
                            permission,
                            reason: reason.to_string(),
                        };
                        if prompt.authorize(request).await {
                            let expires = self.grant_expiry(Utc::now());
                            (true, REASON_USER_GRANTED, expires)
                        } else {
                            (false, REASON_USER_DENIED, None)
                        }
                    }
                    None => (false, REASON_NO_CALLBACK, None),
                }
            }
        };

        let grant = PermissionGrant {
            plugin_id: plugin_id.to_string(),
            permission,
            granted,
            reason: decision.to_string(),
            timestamp: Utc::now(),
            expires_at,
        };

        self.grants
            .insert((plugin_id.to_string(), permission), grant.clone());

        if granted {
            info!("Granted {} to {} ({})", permission, plugin_id, decision);
            self.publish(Event::PermissionGranted {
                plugin_id: plugin_id.to_string(),
                permission,
                reason: decision.to_string(),
            })
            .await;
        } else {
            warn!("Denied {} to {} ({})", permission, plugin_id, decision);
            self.publish(Event::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                permission,
                reason: decision.to_string(),
            })
            .await;
        }

        grant
    }

    /// Request every permission, then check the set for dangerous pairs
    ///
    /// A dangerous pair fails validation even if each permission was
    /// granted individually.
    pub async fn validate_permissions(
        &self,
        plugin_id: &str,
        permissions: &[Permission],
    ) -> PermissionValidation {
        let requested: BTreeSet<Permission> = permissions.iter().copied().collect();
        let mut granted = Vec::new();
        let mut denied = Vec::new();
        let mut errors = Vec::new();

        for permission in &requested {
            let grant = self
                .request_permission(plugin_id, *permission, "requested by plugin manifest")
                .await;
            if grant.granted {
                granted.push(*permission);
            } else {
                errors.push(format!("permission {} denied: {}", permission, grant.reason));
                denied.push(*permission);
            }
        }

        let combinations = dangerous_combinations(&requested);
        for (a, b) in &combinations {
            errors.push(format!("dangerous permission combination: {} + {}", a, b));
        }

        let validation = PermissionValidation {
            is_valid: denied.is_empty() && combinations.is_empty(),
            granted,
            denied,
            risk_level: classify_risk(&requested),
            dangerous_combinations: combinations,
            errors,
        };

        if !validation.is_valid {
            warn!(
                "Permission validation failed for {}: {}",
                plugin_id,
                validation.errors.join("; ")
            );
        }

        validation
    }

    /// Whether `plugin_id` holds a valid grant for `permission`
    pub fn has_permission(&self, plugin_id: &str, permission: Permission) -> bool {
        self.grants
            .get(&(plugin_id.to_string(), permission))
            .map(|grant| grant.is_valid())
            .unwrap_or(false)
    }

    pub fn get_grant(&self, plugin_id: &str, permission: Permission) -> Option<PermissionGrant> {
        self.grants
            .get(&(plugin_id.to_string(), permission))
            .map(|grant| grant.clone())
    }

    /// Permissions currently held by a plugin
    pub fn granted_permissions(&self, plugin_id: &str) -> BTreeSet<Permission> {
        let now = Utc::now();
        self.grants
            .iter()
            .filter(|entry| entry.key().0 == plugin_id && entry.value().is_valid_at(now))
            .map(|entry| entry.key().1)
            .collect()
    }

    /// Remove one grant; returns whether a grant existed
    pub async fn revoke_permission(&self, plugin_id: &str, permission: Permission) -> bool {
        let removed = self
            .grants
            .remove(&(plugin_id.to_string(), permission))
            .is_some();
        if removed {
            info!("Revoked {} from {}", permission, plugin_id);
            self.publish(Event::PermissionRevoked {
                plugin_id: plugin_id.to_string(),
                permission,
            })
            .await;
        }
        removed
    }

    /// Remove every grant held by a plugin; returns how many were removed
    pub async fn revoke_all_permissions(&self, plugin_id: &str) -> usize {
        let keys: Vec<(String, Permission)> = self
            .grants
            .iter()
            .filter(|entry| entry.key().0 == plugin_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for (id, permission) in keys {
            if self.revoke_permission(&id, permission).await {
                removed += 1;
            }
        }
        removed
    }

    /// Every stored decision for a plugin, for `restore_grants`
    pub fn snapshot_grants(&self, plugin_id: &str) -> Vec<PermissionGrant> {
        self.grants
            .iter()
            .filter(|entry| entry.key().0 == plugin_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Put a plugin's grants back to a snapshot
    ///
    /// Grants missing from the snapshot are revoked; the rest are written
    /// back exactly as captured.
    pub async fn restore_grants(&self, plugin_id: &str, snapshot: Vec<PermissionGrant>) {
        let kept: BTreeSet<Permission> = snapshot.iter().map(|g| g.permission).collect();
        let stale: Vec<Permission> = self
            .grants
            .iter()
            .filter(|entry| entry.key().0 == plugin_id && !kept.contains(&entry.key().1))
            .map(|entry| entry.key().1)
            .collect();
        for permission in stale {
            self.revoke_permission(plugin_id, permission).await;
        }
        for grant in snapshot {
            self.grants
                .insert((plugin_id.to_string(), grant.permission), grant);
        }
        debug!("Restored grants for {}", plugin_id);
    }

    /// Drop grants whose expiry has passed; returns how many were removed
    pub fn cleanup_expired_permissions(&self) -> usize {
        let now = Utc::now();
        let before = self.grants.len();
        self.grants
            .retain(|_, grant| grant.expires_at.map_or(true, |expires| expires > now));
        let removed = before.saturating_sub(self.grants.len());
        if removed > 0 {
            debug!("Removed {} expired grants", removed);
        }
        removed
    }

    pub fn get_statistics(&self) -> PermissionStatistics {
        let now = Utc::now();
        let mut stats = PermissionStatistics::default();

        for entry in self.grants.iter() {
            let grant = entry.value();
            stats.total_grants += 1;
            if !grant.granted {
                stats.denied_grants += 1;
            } else if grant.is_valid_at(now) {
                stats.active_grants += 1;
                *stats.by_plugin.entry(grant.plugin_id.clone()).or_insert(0) += 1;
                *stats.by_permission.entry(grant.permission).or_insert(0) += 1;
            } else {
                stats.expired_grants += 1;
            }
        }

        stats
    }

    /// Expiry for a user grant made at `now`
    ///
    /// A ttl that cannot be added to `now` is treated as no expiry.
    fn grant_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = self.grant_ttl?;
        let expires = now.checked_add_signed(ttl);
        if expires.is_none() {
            warn!("Grant ttl {} overflows the clock; grant will not expire", ttl);
        }
        expires
    }

    async fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event).await;
        }
    }
}

impl Default for PermissionAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_bus::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_allow_policy_auto_grants() {
        let authority = PermissionAuthority::new();
        let grant = authority
            .request_permission("clock", Permission::Notifications, "reminders")
            .await;
        assert!(grant.granted);
        assert_eq!(grant.reason, REASON_AUTO_GRANTED);
        assert!(authority.has_permission("clock", Permission::Notifications));
    }

    #[tokio::test]
    async fn test_ask_without_callback_denies() {
        let authority = PermissionAuthority::new();
        let grant = authority
            .request_permission("clock", Permission::Camera, "photos")
            .await;
        assert!(!grant.granted);
        assert_eq!(grant.reason, REASON_NO_CALLBACK);
        assert!(!authority.has_permission("clock", Permission::Camera));
    }

    #[tokio::test]
    async fn test_deny_policy_never_prompts() {
        let authority = PermissionAuthority::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        authority.set_user_authorization_callback(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        authority.set_permission_policy(Permission::Camera, PermissionPolicy::Deny);

        let grant = authority
            .request_permission("clock", Permission::Camera, "photos")
            .await;
        assert!(!grant.granted);
        assert_eq!(grant.reason, REASON_POLICY_DENIED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_user_decision_and_re_evaluation() {
        let authority = PermissionAuthority::new();
        authority.set_user_authorization_callback(|req: AuthorizationRequest| async move {
            req.permission == Permission::Location
        });

        let yes = authority
            .request_permission("maps", Permission::Location, "position")
            .await;
        assert_eq!(yes.reason, REASON_USER_GRANTED);

        let no = authority
            .request_permission("maps", Permission::Microphone, "voice")
            .await;
        assert_eq!(no.reason, REASON_USER_DENIED);

        // Later decisions overwrite earlier ones
        authority.set_permission_policy(Permission::Location, PermissionPolicy::Deny);
        authority
            .request_permission("maps", Permission::Location, "position")
            .await;
        assert!(!authority.has_permission("maps", Permission::Location));
        assert_eq!(authority.get_statistics().total_grants, 2);
    }

    #[tokio::test]
    async fn test_dangerous_pair_fails_even_when_granted() {
        let authority = PermissionAuthority::new();
        authority.set_user_authorization_callback(|_| async { true });

        let validation = authority
            .validate_permissions("sync", &[Permission::FileSystem, Permission::Network])
            .await;
        assert!(!validation.is_valid);
        assert!(validation.denied.is_empty());
        assert_eq!(validation.risk_level, PermissionRisk::High);
        assert_eq!(
            validation.dangerous_combinations,
            vec![(Permission::FileSystem, Permission::Network)]
        );
        assert!(validation.errors[0].contains("dangerous permission combination"));
    }

    #[tokio::test]
    async fn test_risk_levels() {
        let authority = PermissionAuthority::new();
        authority.set_user_authorization_callback(|_| async { true });

        let medium = authority
            .validate_permissions("cam", &[Permission::Camera, Permission::Storage])
            .await;
        assert!(medium.is_valid);
        assert_eq!(medium.risk_level, PermissionRisk::Medium);

        let low = authority
            .validate_permissions("note", &[Permission::Notifications])
            .await;
        assert_eq!(low.risk_level, PermissionRisk::Low);
    }

    #[tokio::test]
    async fn test_revoke_and_statistics() {
        let authority = PermissionAuthority::new();
        authority
            .request_permission("a", Permission::Storage, "cache")
            .await;
        authority
            .request_permission("a", Permission::DeviceInfo, "layout")
            .await;
        authority
            .request_permission("b", Permission::Storage, "cache")
            .await;

        let stats = authority.get_statistics();
        assert_eq!(stats.active_grants, 3);
        assert_eq!(stats.by_plugin.get("a"), Some(&2));
        assert_eq!(stats.by_permission.get(&Permission::Storage), Some(&2));

        assert!(authority.revoke_permission("b", Permission::Storage).await);
        assert!(!authority.revoke_permission("b", Permission::Storage).await);
        assert_eq!(authority.revoke_all_permissions("a").await, 2);
        assert_eq!(authority.get_statistics().total_grants, 0);
    }

    #[tokio::test]
    async fn test_expired_grants_are_invalid_and_swept() {
        let authority = PermissionAuthority::new().with_grant_ttl(Duration::zero());
        authority.set_user_authorization_callback(|_| async { true });

        let grant = authority
            .request_permission("a", Permission::Clipboard, "paste")
            .await;
        assert!(grant.granted);
        assert!(!authority.has_permission("a", Permission::Clipboard));
        assert_eq!(authority.get_statistics().expired_grants, 1);
        assert_eq!(authority.cleanup_expired_permissions(), 1);
        assert!(authority.get_grant("a", Permission::Clipboard).is_none());
    }

    #[tokio::test]
    async fn test_restore_grants_undoes_later_decisions() {
        let authority = PermissionAuthority::new();
        let allow = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let answer = Arc::clone(&allow);
        authority.set_user_authorization_callback(move |_| {
            let answer = Arc::clone(&answer);
            async move { answer.load(Ordering::SeqCst) }
        });

        authority
            .request_permission("cam", Permission::Camera, "photos")
            .await;
        let snapshot = authority.snapshot_grants("cam");

        allow.store(false, Ordering::SeqCst);
        authority
            .request_permission("cam", Permission::Camera, "photos")
            .await;
        authority
            .request_permission("cam", Permission::Notifications, "alerts")
            .await;
        assert!(!authority.has_permission("cam", Permission::Camera));

        authority.restore_grants("cam", snapshot).await;
        assert!(authority.has_permission("cam", Permission::Camera));
        assert!(authority.get_grant("cam", Permission::Notifications).is_none());
    }

    #[tokio::test]
    async fn test_oversized_ttl_does_not_overflow() {
        let authority = PermissionAuthority::new()
            .with_grant_ttl(Duration::try_days(365 * 1_000_000).unwrap());
        authority.set_user_authorization_callback(|_| async { true });

        let grant = authority
            .request_permission("a", Permission::Camera, "scan")
            .await;
        assert!(grant.granted);
        assert_eq!(grant.expires_at, None);
        assert!(authority.has_permission("a", Permission::Camera));
    }

    #[tokio::test]
    async fn test_abandoned_prompt_leaves_no_grant() {
        let authority = Arc::new(PermissionAuthority::new());
        authority.set_user_authorization_callback(|_| std::future::pending::<bool>());

        let pending = {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move {
                authority
                    .request_permission("a", Permission::Camera, "photos")
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Other plugins are not blocked by the pending prompt
        authority
            .request_permission("b", Permission::Storage, "cache")
            .await;
        assert!(authority.has_permission("b", Permission::Storage));

        pending.abort();
        assert!(pending.await.is_err());
        assert!(authority.get_grant("a", Permission::Camera).is_none());
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(MessageBus::new());
        let mut rx = bus.subscribe(EventType::All).await;
        let authority = PermissionAuthority::new().with_bus(Arc::clone(&bus));

        authority
            .request_permission("a", Permission::Storage, "cache")
            .await;
        authority
            .request_permission("a", Permission::Camera, "photos")
            .await;
        authority.revoke_permission("a", Permission::Storage).await;

        assert!(matches!(rx.recv().await, Some(Event::PermissionGranted { .. })));
        assert!(matches!(rx.recv().await, Some(Event::PermissionDenied { .. })));
        assert!(matches!(rx.recv().await, Some(Event::PermissionRevoked { .. })));
    }
}
