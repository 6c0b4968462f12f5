//! Recovery strategies for failed module runtimes
//!
//! When a module fails during a transitional state the manager moves it to
//! `RuntimeState::Error` and offers the failure to each registered strategy
//! in registration order. The first strategy that can handle the failure
//! and reports success wins; the rest are not consulted.

use async_trait::async_trait;
use dashmap::DashMap;
use sdk::errors::PluginError;
use sdk::types::RuntimeState;
use tracing::{info, warn};

use super::runtime::ModuleHost;

/// Default number of restarts allowed per plugin before giving up
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// A module failure offered to recovery strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub plugin_id: String,
    /// State the module was in when the host call failed
    pub during: RuntimeState,
    pub message: String,
}

/// Where the module ends up after a successful recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Module reloaded and running again
    Restarted,
    /// Module stopped and the plugin disabled
    Disabled,
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, failure: &RuntimeFailure) -> bool;

    /// Attempt recovery through the host; true means the module reached the outcome state
    async fn recover(&self, failure: &RuntimeFailure, host: &dyn ModuleHost) -> bool;

    fn outcome(&self) -> RecoveryOutcome;
}

/// Reload and restart the module, at most `max_restarts` times per plugin
pub struct RestartStrategy {
    max_restarts: u32,
    restarts: DashMap<String, u32>,
}

impl RestartStrategy {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            restarts: DashMap::new(),
        }
    }

    pub fn restart_count(&self, plugin_id: &str) -> u32 {
        self.restarts.get(plugin_id).map(|c| *c).unwrap_or(0)
    }

    /// Forget the restart count, e.g. after a manual restart
    pub fn reset(&self, plugin_id: &str) {
        self.restarts.remove(plugin_id);
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESTARTS)
    }
}

#[async_trait]
impl RecoveryStrategy for RestartStrategy {
    fn name(&self) -> &'static str {
        "restart"
    }

    fn can_handle(&self, failure: &RuntimeFailure) -> bool {
        // Failing to stop is not fixed by starting again
        failure.during != RuntimeState::Stopping
            && self.restart_count(&failure.plugin_id) < self.max_restarts
    }

    async fn recover(&self, failure: &RuntimeFailure, host: &dyn ModuleHost) -> bool {
        let attempt = {
            let mut count = self.restarts.entry(failure.plugin_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        info!(
            "Restarting module {} (attempt {}/{})",
            failure.plugin_id, attempt, self.max_restarts
        );

        if let Err(e) = host.stop(&failure.plugin_id).await {
            warn!("Stop before restart of {} failed: {}", failure.plugin_id, e);
        }

        let restarted: Result<(), PluginError> = async {
            host.load(&failure.plugin_id).await?;
            host.initialize(&failure.plugin_id).await?;
            host.start(&failure.plugin_id).await
        }
        .await;

        match restarted {
            Ok(()) => true,
            Err(e) => {
                warn!("Restart of {} failed: {}", failure.plugin_id, e);
                false
            }
        }
    }

    fn outcome(&self) -> RecoveryOutcome {
        RecoveryOutcome::Restarted
    }
}

/// Stop the module and disable the plugin
#[derive(Debug, Default)]
pub struct DisableStrategy;

#[async_trait]
impl RecoveryStrategy for DisableStrategy {
    fn name(&self) -> &'static str {
        "disable"
    }

    fn can_handle(&self, _failure: &RuntimeFailure) -> bool {
        true
    }

    async fn recover(&self, failure: &RuntimeFailure, host: &dyn ModuleHost) -> bool {
        if let Err(e) = host.stop(&failure.plugin_id).await {
            // The module is left for the host to tear down; disabling still applies
            warn!("Stop of failed module {} failed: {}", failure.plugin_id, e);
        }
        true
    }

    fn outcome(&self) -> RecoveryOutcome {
        RecoveryOutcome::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::runtime::tests::ScriptedHost;

    fn failure(during: RuntimeState) -> RuntimeFailure {
        RuntimeFailure {
            plugin_id: "clock".to_string(),
            during,
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_restart_is_bounded() {
        let host = ScriptedHost::default();
        let strategy = RestartStrategy::new(2);
        let f = failure(RuntimeState::Starting);

        assert!(strategy.can_handle(&f));
        assert!(strategy.recover(&f, &host).await);
        assert!(strategy.recover(&f, &host).await);
        assert_eq!(strategy.restart_count("clock"), 2);
        assert!(!strategy.can_handle(&f));

        strategy.reset("clock");
        assert!(strategy.can_handle(&f));
    }

    #[tokio::test]
    async fn test_restart_reports_host_failure() {
        let host = ScriptedHost::failing_on("start");
        let strategy = RestartStrategy::default();
        assert!(!strategy.recover(&failure(RuntimeState::Starting), &host).await);
    }

    #[test]
    fn test_restart_skips_stop_failures() {
        let strategy = RestartStrategy::default();
        assert!(!strategy.can_handle(&failure(RuntimeState::Stopping)));
    }

    #[tokio::test]
    async fn test_disable_always_succeeds() {
        let host = ScriptedHost::failing_on("stop");
        let strategy = DisableStrategy;
        let f = failure(RuntimeState::Stopping);
        assert!(strategy.can_handle(&f));
        assert!(strategy.recover(&f, &host).await);
        assert_eq!(strategy.outcome(), RecoveryOutcome::Disabled);
    }
}
