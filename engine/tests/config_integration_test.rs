//! Integration tests for configuration management
//!
//! These tests load configuration files from disk and check that the
//! components built from them behave as configured.

use sdk::types::{Permission, PermissionPolicy};
use std::fs;
use tempfile::TempDir;
use warden_engine::config::Config;
use warden_engine::signature::SignaturePolicy;
use warden_engine::PluginManager;

#[test]
fn test_config_file_loading() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    fs::write(
        &path,
        r#"
[core]
log_level = "debug"

[security]
max_artifact_bytes = 1024
block_on_warning = true
trusted_sources = ["plugins.example.org"]
denied_sources = ["*.evil.example.com"]

[signature]
policy = "disabled"
trusted_timestamp_authorities = ["tsa.example.org"]

[permissions]
grant_ttl_secs = 3600

[permissions.policies]
camera = "deny"
network = "allow"
"#,
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.signature.policy, SignaturePolicy::Disabled);

    let validator = config.validator_config();
    assert_eq!(validator.max_artifact_bytes, 1024);
    assert!(validator.block_on_warning);

    let authority = config.build_permission_authority().unwrap();
    assert_eq!(authority.get_policy(Permission::Camera), PermissionPolicy::Deny);
    assert_eq!(authority.get_policy(Permission::Network), PermissionPolicy::Allow);
    assert_eq!(authority.get_policy(Permission::Location), PermissionPolicy::Ask);

    assert!(PluginManager::from_config(&config).is_ok());
}

#[test]
fn test_invalid_config_file_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");

    fs::write(&path, "[permissions.policies]\nteleport = \"allow\"\n").unwrap();
    assert!(Config::load_from_path(&path).is_err());

    fs::write(&path, "[permissions.policies]\ncamera = \"maybe\"\n").unwrap();
    assert!(Config::load_from_path(&path).is_err());

    fs::write(&path, "[core\nlog_level = ").unwrap();
    assert!(Config::load_from_path(&path).is_err());

    assert!(Config::load_from_path(&temp.path().join("missing.toml")).is_err());
}

#[test]
fn test_default_config_round_trips_through_toml() {
    let text = toml::to_string_pretty(&Config::default()).unwrap();
    let parsed = Config::from_toml_str(&text).unwrap();
    assert_eq!(parsed.core.log_level, "info");
    assert_eq!(parsed.signature.policy, SignaturePolicy::Optional);
    assert!(parsed.permissions.policies.is_empty());
}
