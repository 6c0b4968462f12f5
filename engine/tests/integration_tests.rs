//! End-to-end tests for the plugin manager
//!
//! These drive the public API the way a host would: install, authorize,
//! enable, update and uninstall, while watching the event stream.

use sdk::errors::{DependencyFailure, PluginError};
use sdk::types::{
    DependencySpec, LifecycleState, Permission, PermissionPolicy, PluginRecord,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use warden_engine::config::Config;
use warden_engine::message_bus::{Event, EventType};
use warden_engine::resolver::DependencyResolver;
use warden_engine::signature::{SignaturePolicy, SigningIdentity};
use warden_engine::{PluginManager, PluginPackage};

fn manifest(id: &str, version: &str, permissions: &[&str], deps: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "name": id,
        "version": version,
        "description": "integration plugin",
        "author": "tests",
        "category": "utility",
        "main": "main.js",
        "permissions": permissions,
        "dependencies": deps,
    }))
    .unwrap()
}

fn manager() -> PluginManager {
    PluginManager::from_config(&Config::default()).unwrap()
}

fn installed(id: &str, version: &str, deps: Vec<DependencySpec>) -> (String, PluginRecord) {
    let mut record = PluginRecord::new(id, id, version);
    record.lifecycle_state = LifecycleState::Installed;
    record.dependencies = deps;
    (id.to_string(), record)
}

#[test]
fn test_system_revalidation_reports_conflict() {
    // B@1.5.0 and C@1.0.0 are installed; C needs B ^2.0.0
    let installed_set: HashMap<String, PluginRecord> = [
        installed("b", "1.5.0", vec![]),
        installed("c", "1.0.0", vec![DependencySpec::required("b", "^2.0.0")]),
    ]
    .into_iter()
    .collect();

    let mut a = PluginRecord::new("a", "a", "1.0.0");
    a.dependencies = vec![DependencySpec::required("b", "^1.0.0")];

    let resolver = DependencyResolver::new();
    let result = resolver.resolve(&a, &installed_set, &HashMap::new());
    assert!(result.success);
    assert_eq!(result.install_order, vec!["b", "a"]);

    let c = &installed_set["c"];
    let revalidated = resolver.resolve(c, &installed_set, &HashMap::new());
    assert!(!revalidated.success);
    assert!(revalidated.install_order.is_empty());
    let conflict = &revalidated.conflicting_dependencies[0];
    assert_eq!(conflict.dependency_id, "b");
    assert_eq!(conflict.found_version, "1.5.0");
    assert_eq!(conflict.required_by, "c");
    assert!(matches!(
        revalidated.to_error(),
        Some(PluginError::DependencyUnsatisfied {
            kind: DependencyFailure::Conflict,
            ..
        })
    ));
}

#[tokio::test]
async fn test_two_node_cycle_never_installs() {
    let m = manager();
    m.stage_available(PluginPackage::new(
        "b",
        manifest("b", "1.0.0", &[], json!([{"id": "a", "version": "^1.0.0"}])),
        b"b()".to_vec(),
    ))
    .unwrap();

    let err = m
        .install(
            "a",
            &manifest("a", "1.0.0", &[], json!([{"id": "b", "version": "^1.0.0"}])),
            b"a()",
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PluginError::DependencyUnsatisfied {
            kind: DependencyFailure::Circular,
            ..
        }
    ));
    assert!(m.list_plugins().is_empty());
}

#[tokio::test]
async fn test_missing_dependency_is_reported() {
    let m = manager();
    let err = m
        .install(
            "weather",
            &manifest(
                "weather",
                "1.0.0",
                &[],
                json!([
                    {"id": "geo", "version": "^1.0.0"},
                    {"id": "maps", "version": "^1.0.0", "required": false}
                ]),
            ),
            b"forecast()",
            None,
        )
        .await
        .unwrap_err();

    match err {
        PluginError::DependencyUnsatisfied { kind, detail } => {
            assert_eq!(kind, DependencyFailure::Missing);
            assert!(detail.contains("geo"));
            assert!(!detail.contains("maps"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_deny_policy_never_prompts() {
    let m = manager();
    let prompts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&prompts);
    m.permissions().set_user_authorization_callback(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }
    });
    m.permissions()
        .set_permission_policy(Permission::Camera, PermissionPolicy::Deny);

    let err = m
        .install(
            "selfie",
            &manifest("selfie", "1.0.0", &["camera"], json!([])),
            b"snap()",
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::PermissionDenied { .. }));
    assert_eq!(prompts.load(Ordering::SeqCst), 0);
    assert!(!m.permissions().has_permission("selfie", Permission::Camera));
}

#[tokio::test]
async fn test_full_lifecycle_with_prompt_and_events() {
    let m = manager();
    let mut states = m.bus().subscribe(EventType::StateChanged).await;
    let mut grants = m.bus().subscribe(EventType::PermissionGranted).await;

    m.permissions()
        .set_user_authorization_callback(|request| async move {
            request.permission == Permission::Location
        });

    let report = m
        .install(
            "tracker",
            &manifest("tracker", "1.0.0", &["location", "storage"], json!([])),
            b"track()",
            Some("https://plugins.example.org/tracker.js"),
        )
        .await
        .unwrap();
    assert_eq!(report.installed, vec!["tracker"]);

    m.enable("tracker").await.unwrap();
    let info = m.get_plugin_info("tracker").unwrap();
    assert_eq!(info.record.lifecycle_state, LifecycleState::Enabled);
    assert!(info.granted_permissions.contains(&Permission::Location));
    assert!(info.granted_permissions.contains(&Permission::Storage));

    m.mark_update_available("tracker", "1.1.0").await.unwrap();
    m.update(
        "tracker",
        &manifest("tracker", "1.1.0", &["location"], json!([])),
        b"track2()",
        None,
    )
    .await
    .unwrap();
    let info = m.get_plugin_info("tracker").unwrap();
    assert_eq!(info.record.version, "1.1.0");
    assert_eq!(info.record.lifecycle_state, LifecycleState::Enabled);
    assert!(info.pending_update.is_none());

    let report = m.uninstall("tracker").await;
    assert!(report.was_installed);
    assert!(report.revoked_permissions >= 1);
    assert!(m.permissions().granted_permissions("tracker").is_empty());

    let mut seen = Vec::new();
    while let Ok(Event::StateChanged(event)) = states.try_recv() {
        assert_eq!(event.plugin_id, "tracker");
        seen.push(event.new_state);
    }
    assert_eq!(seen.first(), Some(&LifecycleState::Installed));
    assert_eq!(seen.last(), Some(&LifecycleState::Uninstalled));
    assert!(seen.contains(&LifecycleState::UpdateAvailable));

    let mut granted = 0;
    while let Ok(Event::PermissionGranted { plugin_id, .. }) = grants.try_recv() {
        assert_eq!(plugin_id, "tracker");
        granted += 1;
    }
    assert!(granted >= 2);
}

#[tokio::test]
async fn test_required_signature_policy() {
    let config = Config::from_toml_str("[signature]\npolicy = \"required\"\n").unwrap();
    let m = PluginManager::from_config(&config).unwrap();
    let bytes = manifest("signed", "1.0.0", &[], json!([]));

    let err = m.install("signed", &bytes, b"run()", None).await.unwrap_err();
    assert!(matches!(err, PluginError::SignatureInvalid(_)));

    m.verifier()
        .set_signing_identity(SigningIdentity::ed25519(&[3u8; 32], "Publisher").unwrap())
        .unwrap();
    let artifact = m.verifier().sign(b"run()", Default::default()).unwrap();
    m.install("signed", &bytes, &artifact, None).await.unwrap();

    // Size counts the payload, not the signature block
    assert_eq!(m.get_plugin_info("signed").unwrap().record.size, 5);
    assert_eq!(m.verifier().policy(), SignaturePolicy::Required);
}

#[tokio::test]
async fn test_dangerous_artifact_rejected_before_any_state_change() {
    let m = manager();
    let mut audits = m.bus().subscribe(EventType::Audit).await;

    let err = m
        .install(
            "dropper",
            &manifest("dropper", "1.0.0", &[], json!([])),
            b"Process.run('sh', []);\nFile(p).writeAsStringSync(payload);\n",
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::SecurityRejected(_)));
    assert!(m.get_plugin_info("dropper").is_none());
    let history = m.lifecycle_history("dropper");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].new_state, LifecycleState::NotInstalled);
    assert!(history[0].error.is_some());
    assert!(matches!(audits.try_recv(), Ok(Event::Audit(_))));
}

#[tokio::test]
async fn test_concurrent_installs_of_same_plugin() {
    let m = Arc::new(manager());
    let bytes = manifest("solo", "1.0.0", &[], json!([]));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let m = Arc::clone(&m);
        let bytes = bytes.clone();
        handles.push(tokio::spawn(async move {
            m.install("solo", &bytes, b"solo()", None).await
        }));
    }

    let mut ok = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(PluginError::AlreadyExists(_)) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(duplicates, 7);
}

#[tokio::test]
async fn test_idle_subscriber_does_not_stall_other_plugins() {
    let m = manager();
    let _never_read = m.bus().subscribe(EventType::All).await;
    m.permissions()
        .set_user_authorization_callback(|_| async { true });

    for _ in 0..100 {
        m.permissions()
            .request_permission("a", Permission::Clipboard, "paste")
            .await;
    }

    let other = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        m.permissions()
            .request_permission("b", Permission::Clipboard, "paste"),
    )
    .await
    .expect("request for an unrelated plugin stalled");
    assert!(other.granted);

    let install = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        m.install("clock", &manifest("clock", "1.0.0", &[], json!([])), b"tick", None),
    )
    .await
    .expect("install stalled");
    assert!(install.is_ok());
}

#[tokio::test]
async fn test_refused_update_preserves_installed_version_and_grants() {
    let m = manager();
    let allow = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let answer = Arc::clone(&allow);
    m.permissions().set_user_authorization_callback(move |_| {
        let answer = Arc::clone(&answer);
        async move { answer.load(Ordering::SeqCst) }
    });

    m.install("cam", &manifest("cam", "1.0.0", &["camera"], json!([])), b"v1", None)
        .await
        .unwrap();
    m.enable("cam").await.unwrap();

    allow.store(false, Ordering::SeqCst);
    let err = m
        .update("cam", &manifest("cam", "1.1.0", &["camera"], json!([])), b"v2", None)
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::PermissionDenied { .. }));

    let info = m.get_plugin_info("cam").unwrap();
    assert_eq!(info.record.version, "1.0.0");
    assert_eq!(info.record.lifecycle_state, LifecycleState::Enabled);
    assert!(info.granted_permissions.contains(&Permission::Camera));

    // Still usable after the refused update
    m.disable("cam").await.unwrap();
    m.enable("cam").await.unwrap();
}
