//! Configuration management
//!
//! This module handles loading, validation, and management of the Warden configuration.
//! Configuration is stored in TOML format at ~/.warden/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level
//! - **security**: Artifact scan thresholds and source allow/deny lists
//! - **signature**: Signature policy, trusted timestamp authorities and certificates
//! - **permissions**: Grant expiry and per-permission policy overrides
//!
//! # Examples
//!
//! ```no_run
//! use warden_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Signature policy: {:?}", config.signature.policy);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use sdk::errors::PluginError;
use sdk::types::{Permission, PermissionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::permissions::PermissionAuthority;
use crate::signature::{CertificateInfo, RevocationStatus, SignaturePolicy, SignatureVerifier};
use crate::trust::ValidatorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub signature: SignatureConfig,

    #[serde(default)]
    pub permissions: PermissionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Artifact trust settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Artifacts above this size produce a finding
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Treat warnings as fatal
    #[serde(default)]
    pub block_on_warning: bool,

    #[serde(default)]
    pub trusted_sources: Vec<String>,

    #[serde(default)]
    pub denied_sources: Vec<String>,

    #[serde(default = "default_obfuscation_min_token_len")]
    pub obfuscation_min_token_len: usize,

    #[serde(default = "default_obfuscation_repeat_lines")]
    pub obfuscation_repeat_lines: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_artifact_bytes: default_max_artifact_bytes(),
            block_on_warning: false,
            trusted_sources: Vec::new(),
            denied_sources: Vec::new(),
            obfuscation_min_token_len: default_obfuscation_min_token_len(),
            obfuscation_repeat_lines: default_obfuscation_repeat_lines(),
        }
    }
}

/// Signature verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_signature_policy")]
    pub policy: SignaturePolicy,

    #[serde(default)]
    pub trusted_timestamp_authorities: Vec<String>,

    #[serde(default)]
    pub trusted_certificates: Vec<TrustedCertificate>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            policy: default_signature_policy(),
            trusted_timestamp_authorities: Vec::new(),
            trusted_certificates: Vec::new(),
        }
    }
}

/// Certificate entry in `[[signature.trusted_certificates]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedCertificate {
    pub subject: String,
    #[serde(default)]
    pub issuer: Option<String>,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    #[serde(default)]
    pub revoked: bool,
}

impl TrustedCertificate {
    fn to_certificate(&self) -> Result<CertificateInfo, PluginError> {
        let key = hex::decode(self.public_key.trim()).map_err(|e| {
            PluginError::Config(format!(
                "Certificate '{}' has an invalid public key: {}",
                self.subject, e
            ))
        })?;
        if key.len() != 32 {
            return Err(PluginError::Config(format!(
                "Certificate '{}' public key must be 32 bytes, got {}",
                self.subject,
                key.len()
            )));
        }
        if self.not_before >= self.not_after {
            return Err(PluginError::Config(format!(
                "Certificate '{}' not_before must precede not_after",
                self.subject
            )));
        }

        let mut cert = CertificateInfo::new(
            self.subject.clone(),
            self.issuer.clone().unwrap_or_else(|| self.subject.clone()),
            self.serial_number.clone(),
            self.not_before,
            self.not_after,
            key,
        );
        if self.revoked {
            cert.revocation_status = RevocationStatus::Revoked;
        }
        Ok(cert)
    }
}

/// Permission settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Expiry for user-approved grants
    #[serde(default)]
    pub grant_ttl_secs: Option<u64>,

    /// Permission name -> allow | deny | ask
    #[serde(default)]
    pub policies: BTreeMap<String, String>,
}

/// Longest accepted grant expiry (ten years)
pub const MAX_GRANT_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_artifact_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_obfuscation_min_token_len() -> usize {
    40
}

fn default_obfuscation_repeat_lines() -> usize {
    5
}

fn default_signature_policy() -> SignaturePolicy {
    SignaturePolicy::Optional
}

impl Config {
    /// Load configuration from the default location (~/.warden/config.toml)
    ///
    /// If the configuration file doesn't exist, a default configuration is
    /// written there first.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::Config` if the file cannot be read or written,
    /// TOML parsing fails, or validation fails.
    pub fn load_or_create() -> Result<Self, PluginError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, PluginError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PluginError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, PluginError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| PluginError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self, PluginError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PluginError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| PluginError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| PluginError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// ~/.warden/config.toml
    pub fn default_config_path() -> Result<PathBuf, PluginError> {
        let home = dirs::home_dir()
            .ok_or_else(|| PluginError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".warden").join("config.toml"))
    }

    fn validate(&self) -> Result<(), PluginError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(PluginError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.security.max_artifact_bytes == 0 {
            return Err(PluginError::Config(
                "max_artifact_bytes must be greater than zero".to_string(),
            ));
        }
        if self.security.obfuscation_min_token_len == 0 {
            return Err(PluginError::Config(
                "obfuscation_min_token_len must be greater than zero".to_string(),
            ));
        }
        if self.security.obfuscation_repeat_lines < 2 {
            return Err(PluginError::Config(
                "obfuscation_repeat_lines must be at least 2".to_string(),
            ));
        }

        for cert in &self.signature.trusted_certificates {
            cert.to_certificate()?;
        }

        if let Some(secs) = self.permissions.grant_ttl_secs {
            if secs > MAX_GRANT_TTL_SECS {
                return Err(PluginError::Config(format!(
                    "grant_ttl_secs must be at most {} (got {})",
                    MAX_GRANT_TTL_SECS, secs
                )));
            }
        }

        self.policy_overrides()?;

        Ok(())
    }

    /// Parsed `[permissions.policies]` table
    pub fn policy_overrides(&self) -> Result<Vec<(Permission, PermissionPolicy)>, PluginError> {
        self.permissions
            .policies
            .iter()
            .map(|(name, policy)| {
                let permission = name
                    .parse::<Permission>()
                    .map_err(|e| PluginError::Config(format!("[permissions.policies] {}", e)))?;
                let policy = policy.parse::<PermissionPolicy>().map_err(|e| {
                    PluginError::Config(format!("[permissions.policies] {}: {}", name, e))
                })?;
                Ok((permission, policy))
            })
            .collect()
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_artifact_bytes: self.security.max_artifact_bytes,
            block_on_warning: self.security.block_on_warning,
            trusted_sources: self.security.trusted_sources.clone(),
            denied_sources: self.security.denied_sources.clone(),
            obfuscation_min_token_len: self.security.obfuscation_min_token_len,
            obfuscation_repeat_lines: self.security.obfuscation_repeat_lines,
        }
    }

    /// Verifier with the configured policy and trust store
    pub fn build_signature_verifier(&self) -> Result<SignatureVerifier, PluginError> {
        let verifier = SignatureVerifier::new(self.signature.policy);
        for authority in &self.signature.trusted_timestamp_authorities {
            verifier.trust_timestamp_authority(authority.clone());
        }
        for cert in &self.signature.trusted_certificates {
            verifier.trust_certificate(cert.to_certificate()?);
        }
        Ok(verifier)
    }

    /// Authority with the configured expiry and policy overrides
    pub fn build_permission_authority(&self) -> Result<PermissionAuthority, PluginError> {
        let mut authority = PermissionAuthority::new();
        if let Some(secs) = self.permissions.grant_ttl_secs {
            let ttl = i64::try_from(secs)
                .ok()
                .filter(|_| secs <= MAX_GRANT_TTL_SECS)
                .and_then(Duration::try_seconds)
                .ok_or_else(|| {
                    PluginError::Config(format!("grant_ttl_secs {} is out of range", secs))
                })?;
            authority = authority.with_grant_ttl(ttl);
        }
        for (permission, policy) in self.policy_overrides()? {
            authority.set_permission_policy(permission, policy);
        }
        Ok(authority)
    }
}
