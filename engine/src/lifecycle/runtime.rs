//! Module runtime state machine
//!
//! Plugins hosted as running modules move through
//! `Loading -> Loaded -> Initializing -> Initialized -> Starting -> Running`,
//! can be paused and resumed, and stop through `Stopping -> Stopped`. The
//! host performs the actual work behind the `ModuleHost` trait; the manager
//! only validates transitions, records them and runs recovery on failure.

use async_trait::async_trait;
use chrono::Utc;
use sdk::errors::PluginError;
use sdk::types::{LifecycleState, RuntimeState};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::recovery::{RecoveryOutcome, RuntimeFailure};
use super::PluginManager;
use crate::message_bus::Event;

/// Host side of a running module
#[async_trait]
pub trait ModuleHost: Send + Sync {
    async fn load(&self, plugin_id: &str) -> Result<(), PluginError>;
    async fn initialize(&self, plugin_id: &str) -> Result<(), PluginError>;
    async fn start(&self, plugin_id: &str) -> Result<(), PluginError>;
    async fn pause(&self, plugin_id: &str) -> Result<(), PluginError>;
    async fn resume(&self, plugin_id: &str) -> Result<(), PluginError>;
    async fn stop(&self, plugin_id: &str) -> Result<(), PluginError>;
}

#[derive(Debug, Clone, Copy)]
enum HostCall {
    Load,
    Initialize,
    Start,
    Pause,
    Resume,
    Stop,
}

impl HostCall {
    async fn invoke(self, host: &dyn ModuleHost, plugin_id: &str) -> Result<(), PluginError> {
        match self {
            HostCall::Load => host.load(plugin_id).await,
            HostCall::Initialize => host.initialize(plugin_id).await,
            HostCall::Start => host.start(plugin_id).await,
            HostCall::Pause => host.pause(plugin_id).await,
            HostCall::Resume => host.resume(plugin_id).await,
            HostCall::Stop => host.stop(plugin_id).await,
        }
    }
}

/// (transitional state, host call, settled state)
type Step = (RuntimeState, HostCall, RuntimeState);

const LOAD_STEPS: [Step; 2] = [
    (RuntimeState::Loading, HostCall::Load, RuntimeState::Loaded),
    (
        RuntimeState::Initializing,
        HostCall::Initialize,
        RuntimeState::Initialized,
    ),
];

const START_STEP: Step = (RuntimeState::Starting, HostCall::Start, RuntimeState::Running);
const PAUSE_STEP: Step = (RuntimeState::Pausing, HostCall::Pause, RuntimeState::Paused);
const RESUME_STEP: Step = (RuntimeState::Starting, HostCall::Resume, RuntimeState::Running);
const STOP_STEP: Step = (RuntimeState::Stopping, HostCall::Stop, RuntimeState::Stopped);

/// States walked after a successful restart
const RESTART_PATH: [RuntimeState; 6] = [
    RuntimeState::Loading,
    RuntimeState::Loaded,
    RuntimeState::Initializing,
    RuntimeState::Initialized,
    RuntimeState::Starting,
    RuntimeState::Running,
];

impl PluginManager {
    pub fn runtime_state(&self, plugin_id: &str) -> Option<RuntimeState> {
        self.records.get(plugin_id).map(|e| e.runtime)
    }

    /// Load and initialize an enabled plugin's module
    pub async fn load_module(&self, plugin_id: &str) -> Result<RuntimeState, PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let host = self.module_host()?;
        self.require_enabled(plugin_id)?;
        self.drive(plugin_id, &host, &LOAD_STEPS).await
    }

    /// Start the module, loading it first when needed
    pub async fn start_module(&self, plugin_id: &str) -> Result<RuntimeState, PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let host = self.module_host()?;
        self.require_enabled(plugin_id)?;

        let current = self.require_runtime(plugin_id)?;
        let steps: Vec<Step> = match current {
            RuntimeState::Unloaded | RuntimeState::Error => {
                LOAD_STEPS.iter().copied().chain([START_STEP]).collect()
            }
            RuntimeState::Initialized | RuntimeState::Stopped => vec![START_STEP],
            RuntimeState::Running => return Ok(RuntimeState::Running),
            other => {
                return Err(PluginError::IllegalStateTransition {
                    from: other.to_string(),
                    to: RuntimeState::Running.to_string(),
                })
            }
        };
        self.drive(plugin_id, &host, &steps).await
    }

    pub async fn pause_module(&self, plugin_id: &str) -> Result<RuntimeState, PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let host = self.module_host()?;
        self.drive(plugin_id, &host, &[PAUSE_STEP]).await
    }

    pub async fn resume_module(&self, plugin_id: &str) -> Result<RuntimeState, PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let host = self.module_host()?;
        self.require_enabled(plugin_id)?;
        self.drive(plugin_id, &host, &[RESUME_STEP]).await
    }

    pub async fn stop_module(&self, plugin_id: &str) -> Result<RuntimeState, PluginError> {
        let lock = self.op_lock(plugin_id);
        let _guard = lock.lock().await;

        let host = self.module_host()?;
        self.drive(plugin_id, &host, &[STOP_STEP]).await
    }

    /// Best-effort stop used by disable, update and uninstall
    ///
    /// Caller holds the plugin's operation lock. Failures are logged and
    /// leave the module in `Error`; no recovery runs.
    pub(super) async fn stop_if_active(&self, plugin_id: &str) {
        let Some(host) = self.host.clone() else {
            return;
        };
        let Some(current) = self.runtime_state(plugin_id) else {
            return;
        };
        if !matches!(
            current,
            RuntimeState::Running | RuntimeState::Paused | RuntimeState::Error
        ) {
            return;
        }

        if self
            .set_runtime(plugin_id, RuntimeState::Stopping, None)
            .await
            .is_err()
        {
            return;
        }
        let next = match host.stop(plugin_id).await {
            Ok(()) => (RuntimeState::Stopped, None),
            Err(e) => {
                warn!("Stopping module {} failed: {}", plugin_id, e);
                (RuntimeState::Error, Some(e.to_string()))
            }
        };
        if let Err(e) = self.set_runtime(plugin_id, next.0, next.1).await {
            warn!("Could not record stop of {}: {}", plugin_id, e);
        }
    }

    async fn drive(
        &self,
        plugin_id: &str,
        host: &Arc<dyn ModuleHost>,
        steps: &[Step],
    ) -> Result<RuntimeState, PluginError> {
        for (transitional, call, settled) in steps {
            self.set_runtime(plugin_id, *transitional, None).await?;
            if let Err(e) = call.invoke(host.as_ref(), plugin_id).await {
                return self.handle_failure(plugin_id, host, *transitional, e).await;
            }
            self.set_runtime(plugin_id, *settled, None).await?;
        }
        self.require_runtime(plugin_id)
    }

    /// Move to `Error` and run the recovery strategies in order
    async fn handle_failure(
        &self,
        plugin_id: &str,
        host: &Arc<dyn ModuleHost>,
        during: RuntimeState,
        err: PluginError,
    ) -> Result<RuntimeState, PluginError> {
        warn!("Module {} failed while {}: {}", plugin_id, during, err);
        self.set_runtime(plugin_id, RuntimeState::Error, Some(err.to_string()))
            .await?;

        let failure = RuntimeFailure {
            plugin_id: plugin_id.to_string(),
            during,
            message: err.to_string(),
        };

        for strategy in &self.recovery {
            if !strategy.can_handle(&failure) {
                continue;
            }
            debug!("Trying {} recovery for {}", strategy.name(), plugin_id);
            if !strategy.recover(&failure, host.as_ref()).await {
                continue;
            }

            info!("Module {} recovered by {}", plugin_id, strategy.name());
            match strategy.outcome() {
                RecoveryOutcome::Restarted => {
                    for state in RESTART_PATH {
                        self.set_runtime(plugin_id, state, None).await?;
                    }
                    return Ok(RuntimeState::Running);
                }
                RecoveryOutcome::Disabled => {
                    self.set_runtime(plugin_id, RuntimeState::Stopped, None)
                        .await?;
                    if self.lifecycle_state(plugin_id) != Some(LifecycleState::Disabled) {
                        self.transition(plugin_id, LifecycleState::Disabled).await?;
                    }
                    return Err(err);
                }
            }
        }

        warn!("No recovery strategy handled failure of {}", plugin_id);
        Err(err)
    }

    async fn set_runtime(
        &self,
        plugin_id: &str,
        to: RuntimeState,
        error: Option<String>,
    ) -> Result<(), PluginError> {
        let from = {
            let mut entry = self
                .records
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::not_installed(plugin_id))?;
            let from = entry.runtime;
            if !from.can_transition_to(to) {
                return Err(PluginError::IllegalStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            entry.runtime = to;
            from
        };

        debug!("Module {}: {} -> {}", plugin_id, from, to);
        self.bus
            .publish(Event::RuntimeChanged {
                plugin_id: plugin_id.to_string(),
                old_state: from,
                new_state: to,
                timestamp: Utc::now(),
                error,
            })
            .await;
        Ok(())
    }

    fn module_host(&self) -> Result<Arc<dyn ModuleHost>, PluginError> {
        self.host
            .clone()
            .ok_or_else(|| PluginError::Config("no module host configured".to_string()))
    }

    fn require_enabled(&self, plugin_id: &str) -> Result<(), PluginError> {
        match self.lifecycle_state(plugin_id) {
            None => Err(PluginError::not_installed(plugin_id)),
            Some(LifecycleState::Enabled) => Ok(()),
            Some(other) => Err(PluginError::IllegalStateTransition {
                from: other.to_string(),
                to: "running".to_string(),
            }),
        }
    }

    fn require_runtime(&self, plugin_id: &str) -> Result<RuntimeState, PluginError> {
        self.runtime_state(plugin_id)
            .ok_or_else(|| PluginError::not_installed(plugin_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lifecycle::recovery::{DisableStrategy, RecoveryStrategy, RestartStrategy};
    use crate::message_bus::MessageBus;
    use crate::permissions::PermissionAuthority;
    use crate::signature::{SignaturePolicy, SignatureVerifier};
    use crate::trust::{ArtifactValidator, ValidatorConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Host whose calls succeed unless scripted to fail
    #[derive(Default)]
    pub struct ScriptedHost {
        fail_on: Mutex<Option<&'static str>>,
        /// Number of failures left before the scripted call succeeds again
        failures_left: AtomicUsize,
        pub calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedHost {
        pub fn failing_on(call: &'static str) -> Self {
            Self::failing_times(call, usize::MAX)
        }

        pub fn failing_times(call: &'static str, times: usize) -> Self {
            Self {
                fail_on: Mutex::new(Some(call)),
                failures_left: AtomicUsize::new(times),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push(call);
            let scripted = *self.fail_on.lock().unwrap() == Some(call);
            if scripted && self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(PluginError::Internal(format!("{} failed", call)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ModuleHost for ScriptedHost {
        async fn load(&self, _plugin_id: &str) -> Result<(), PluginError> {
            self.record("load")
        }
        async fn initialize(&self, _plugin_id: &str) -> Result<(), PluginError> {
            self.record("initialize")
        }
        async fn start(&self, _plugin_id: &str) -> Result<(), PluginError> {
            self.record("start")
        }
        async fn pause(&self, _plugin_id: &str) -> Result<(), PluginError> {
            self.record("pause")
        }
        async fn resume(&self, _plugin_id: &str) -> Result<(), PluginError> {
            self.record("resume")
        }
        async fn stop(&self, _plugin_id: &str) -> Result<(), PluginError> {
            self.record("stop")
        }
    }

    async fn enabled_manager(
        host: Arc<ScriptedHost>,
        strategies: Vec<Arc<dyn RecoveryStrategy>>,
    ) -> PluginManager {
        let bus = Arc::new(MessageBus::new());
        let manager = PluginManager::new(
            Arc::new(ArtifactValidator::new(ValidatorConfig::default()).unwrap()),
            Arc::new(SignatureVerifier::new(SignaturePolicy::Disabled)),
            Arc::new(PermissionAuthority::new()),
            bus,
        )
        .with_module_host(host)
        .with_recovery_strategies(strategies);

        let manifest = br#"{"id":"clock","name":"Clock","version":"1.0.0","description":"d",
            "author":"a","category":"utility","main":"clock.js"}"#;
        manager.install("clock", manifest, b"tick", None).await.unwrap();
        manager.enable("clock").await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_full_runtime_cycle() {
        let host = Arc::new(ScriptedHost::default());
        let m = enabled_manager(Arc::clone(&host), vec![]).await;

        assert_eq!(m.runtime_state("clock"), Some(RuntimeState::Unloaded));
        assert_eq!(m.start_module("clock").await.unwrap(), RuntimeState::Running);
        assert_eq!(m.pause_module("clock").await.unwrap(), RuntimeState::Paused);
        assert_eq!(m.resume_module("clock").await.unwrap(), RuntimeState::Running);
        assert_eq!(m.stop_module("clock").await.unwrap(), RuntimeState::Stopped);

        assert_eq!(
            *host.calls.lock().unwrap(),
            vec!["load", "initialize", "start", "pause", "resume", "stop"]
        );
        assert_eq!(m.get_statistics().running_modules, 0);
    }

    #[tokio::test]
    async fn test_illegal_runtime_transition() {
        let host = Arc::new(ScriptedHost::default());
        let m = enabled_manager(host, vec![]).await;
        assert!(matches!(
            m.pause_module("clock").await,
            Err(PluginError::IllegalStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_plugin_cannot_start() {
        let host = Arc::new(ScriptedHost::default());
        let m = enabled_manager(host, vec![]).await;
        m.disable("clock").await.unwrap();
        assert!(m.start_module("clock").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_without_recovery_leaves_error() {
        let host = Arc::new(ScriptedHost::failing_on("start"));
        let m = enabled_manager(host, vec![]).await;
        assert!(m.start_module("clock").await.is_err());
        assert_eq!(m.runtime_state("clock"), Some(RuntimeState::Error));
    }

    #[tokio::test]
    async fn test_restart_recovers_transient_failure() {
        let host = Arc::new(ScriptedHost::failing_times("start", 1));
        let m = enabled_manager(
            host,
            vec![Arc::new(RestartStrategy::new(2)), Arc::new(DisableStrategy)],
        )
        .await;

        assert_eq!(m.start_module("clock").await.unwrap(), RuntimeState::Running);
        assert_eq!(m.runtime_state("clock"), Some(RuntimeState::Running));
    }

    #[tokio::test]
    async fn test_persistent_failure_falls_through_to_disable() {
        let host = Arc::new(ScriptedHost::failing_on("start"));
        let m = enabled_manager(
            host,
            vec![Arc::new(RestartStrategy::new(1)), Arc::new(DisableStrategy)],
        )
        .await;

        assert!(m.start_module("clock").await.is_err());
        assert_eq!(m.runtime_state("clock"), Some(RuntimeState::Stopped));
        assert_eq!(m.lifecycle_state("clock"), Some(LifecycleState::Disabled));
    }

    #[tokio::test]
    async fn test_disable_stops_running_module() {
        let host = Arc::new(ScriptedHost::default());
        let m = enabled_manager(Arc::clone(&host), vec![]).await;
        m.start_module("clock").await.unwrap();

        m.disable("clock").await.unwrap();
        assert_eq!(m.runtime_state("clock"), Some(RuntimeState::Stopped));
        assert_eq!(host.calls.lock().unwrap().last(), Some(&"stop"));
    }
}
