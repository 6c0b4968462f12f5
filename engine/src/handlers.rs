//! Command handlers
//!
//! Each handler reads its inputs from disk, runs the matching engine
//! component and prints either a text report or JSON.

use anyhow::{bail, Context, Result};
use sdk::manifest::PluginManifest;
use sdk::types::{LifecycleState, PluginRecord};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::resolver::DependencyResolver;
use crate::signature::{self, SigningIdentity};
use crate::trust::ArtifactValidator;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Validate a manifest file
pub fn handle_manifest(file: &Path, format: OutputFormat) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let manifest = PluginManifest::from_bytes(&bytes)?;

    match format {
        OutputFormat::Text => {
            println!("✓ {} {} ({})", manifest.id, manifest.version, manifest.name);
            println!("  Category:     {}", manifest.category.as_str());
            println!("  Author:       {}", manifest.author);
            if !manifest.permissions.is_empty() {
                let names: Vec<&str> = manifest.permissions.iter().map(|p| p.as_str()).collect();
                println!("  Permissions:  {}", names.join(", "));
            }
            for dep in &manifest.dependencies {
                println!(
                    "  Depends on:   {} {}{}",
                    dep.plugin_id,
                    dep.version_constraint,
                    if dep.is_required { "" } else { " (optional)" }
                );
            }
        }
        OutputFormat::Json => print_json(&manifest)?,
    }
    Ok(())
}

/// Run the trust scan over an artifact
///
/// Exits with an error when the artifact would be rejected.
pub fn handle_scan(
    config: &Config,
    file: &Path,
    source: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let validator = ArtifactValidator::new(config.validator_config())?;
    let label = file.display().to_string();
    let result = validator.validate(&label, signature::strip_signature(&bytes), source);

    match format {
        OutputFormat::Text => {
            println!("Risk level: {:?}", result.overall_risk_level);
            println!("BLAKE3:     {}", result.artifact_hash);
            if result.trusted_source {
                println!("Source:     trusted");
            }
            for finding in &result.findings {
                let location = finding
                    .line
                    .map(|l| format!("line {}: ", l))
                    .unwrap_or_default();
                println!(
                    "  [{:?}] {} ({:?}) {}{}",
                    finding.severity, finding.title, finding.threat_type, location, finding.evidence
                );
            }
        }
        OutputFormat::Json => print_json(&result)?,
    }

    if !result.is_valid {
        bail!("{} rejected: {}", label, result.summary());
    }
    Ok(())
}

/// Sign an artifact with a seed read from disk
pub fn handle_sign(
    file: &Path,
    key: &Path,
    subject: &str,
    attributes: &[String],
    out: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let seed_hex =
        fs::read_to_string(key).with_context(|| format!("Failed to read key {}", key.display()))?;
    let seed = hex::decode(seed_hex.trim()).context("Key file must contain hex")?;
    let identity = SigningIdentity::ed25519(&seed, subject)?;
    let certificate = identity.certificate.clone();

    let mut attrs = BTreeMap::new();
    for attr in attributes {
        let Some((k, v)) = attr.split_once('=') else {
            bail!("Attribute '{}' must be KEY=VALUE", attr);
        };
        attrs.insert(k.trim().to_string(), v.trim().to_string());
    }

    let verifier = signature::SignatureVerifier::new(signature::SignaturePolicy::Required);
    verifier.set_signing_identity(identity)?;

    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let signed = verifier.sign(&bytes, attrs)?;

    let out_path = out.map(Path::to_path_buf).unwrap_or_else(|| {
        let mut name = file.as_os_str().to_owned();
        name.push(".signed");
        PathBuf::from(name)
    });
    fs::write(&out_path, &signed)
        .with_context(|| format!("Failed to write {}", out_path.display()))?;

    match format {
        OutputFormat::Text => {
            println!("✓ Signed {} -> {}", file.display(), out_path.display());
            println!("  Fingerprint: {}", certificate.fingerprint);
            println!("  Public key:  {}", hex::encode(&certificate.public_key));
        }
        OutputFormat::Json => print_json(&json!({
            "output": out_path.display().to_string(),
            "certificate": certificate,
        }))?,
    }
    Ok(())
}

/// Verify an artifact against the configured trust store
pub fn handle_verify(config: &Config, file: &Path, format: OutputFormat) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let verifier = config.build_signature_verifier()?;
    let label = file.display().to_string();
    let result = verifier.verify(&label, &bytes);

    match format {
        OutputFormat::Text => {
            println!(
                "{} {} ({} signatures)",
                if result.is_valid { "✓" } else { "✗" },
                label,
                result.signatures.len()
            );
            for sig in &result.signatures {
                let subject = sig
                    .certificate
                    .as_ref()
                    .map(|c| c.subject.as_str())
                    .unwrap_or("unknown");
                println!(
                    "  {} {} by {}{}",
                    if sig.trusted { "trusted" } else { "untrusted" },
                    sig.algorithm,
                    subject,
                    sig.timestamp
                        .as_ref()
                        .map(|t| format!(" at {} ({})", t.time, t.authority))
                        .unwrap_or_default()
                );
            }
            for warning in &result.warnings {
                println!("  warning: {}", warning);
            }
            for error in &result.errors {
                println!("  error: {}", error);
            }
        }
        OutputFormat::Json => print_json(&result)?,
    }

    if !result.is_valid {
        bail!("Signature verification failed for {}", label);
    }
    Ok(())
}

/// Resolve a manifest against directories of installed and available manifests
pub fn handle_resolve(
    manifest: &Path,
    installed: Option<&Path>,
    available: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let bytes =
        fs::read(manifest).with_context(|| format!("Failed to read {}", manifest.display()))?;
    let target = PluginManifest::from_bytes(&bytes)?.to_record(0);

    let installed = match installed {
        Some(dir) => load_records(dir, LifecycleState::Installed)?,
        None => HashMap::new(),
    };
    let available = match available {
        Some(dir) => load_records(dir, LifecycleState::NotInstalled)?,
        None => HashMap::new(),
    };

    let result = DependencyResolver::new().resolve(&target, &installed, &available);

    match format {
        OutputFormat::Text => {
            if result.success {
                println!("✓ Install order: {}", result.install_order.join(" -> "));
            } else {
                println!("✗ {}", result.error.as_deref().unwrap_or("resolution failed"));
                for missing in &result.missing_dependencies {
                    println!(
                        "  missing: {} {} (required by {})",
                        missing.dependency_id, missing.constraint, missing.required_by
                    );
                }
                for conflict in &result.conflicting_dependencies {
                    println!(
                        "  conflict: {} requires {} {}, found {}",
                        conflict.required_by,
                        conflict.dependency_id,
                        conflict.constraint,
                        conflict.found_version
                    );
                }
                for cycle in &result.circular_dependencies {
                    println!("  cycle: {}", cycle.join(" -> "));
                }
            }
            for warning in &result.warnings {
                println!("  warning: {}", warning);
            }
        }
        OutputFormat::Json => print_json(&result)?,
    }

    if !result.success {
        bail!("Dependency resolution failed for {}", target.id);
    }
    Ok(())
}

/// Load every `*.json` manifest in `dir` as a record
fn load_records(dir: &Path, state: LifecycleState) -> Result<HashMap<String, PluginRecord>> {
    let mut records = HashMap::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = fs::read(&path)?;
        let manifest = PluginManifest::from_bytes(&bytes)
            .with_context(|| format!("Invalid manifest {}", path.display()))?;
        let mut record = manifest.to_record(0);
        record.lifecycle_state = state;
        records.insert(record.id.clone(), record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, id: &str, version: &str, deps: serde_json::Value) -> PathBuf {
        let path = dir.join(format!("{}.json", id));
        let body = json!({
            "id": id, "name": id, "version": version, "description": "d",
            "author": "a", "category": "utility", "main": "main.js",
            "dependencies": deps,
        });
        fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_resolve_against_installed_dir() {
        let installed = TempDir::new().unwrap();
        write_manifest(installed.path(), "lib", "1.4.0", json!([]));
        fs::write(installed.path().join("notes.txt"), "ignored").unwrap();

        let work = TempDir::new().unwrap();
        let target = write_manifest(
            work.path(),
            "app",
            "1.0.0",
            json!([{"id": "lib", "version": "^1.0.0"}]),
        );

        assert!(handle_resolve(&target, Some(installed.path()), None, OutputFormat::Json).is_ok());

        let strict = write_manifest(
            work.path(),
            "strict",
            "1.0.0",
            json!([{"id": "lib", "version": "^2.0.0"}]),
        );
        assert!(handle_resolve(&strict, Some(installed.path()), None, OutputFormat::Text).is_err());
    }

    #[test]
    fn test_sign_then_verify_with_configured_certificate() {
        let dir = TempDir::new().unwrap();
        let seed = [5u8; 32];
        let key_path = dir.path().join("seed.hex");
        fs::write(&key_path, hex::encode(seed)).unwrap();
        let artifact = dir.path().join("plugin.js");
        fs::write(&artifact, b"console.log('hi')").unwrap();

        handle_sign(
            &artifact,
            &key_path,
            "Acme",
            &["plugin=demo".to_string()],
            None,
            OutputFormat::Text,
        )
        .unwrap();
        let signed = dir.path().join("plugin.js.signed");
        assert!(signed.exists());

        // Unknown signer under the default config
        assert!(handle_verify(&Config::default(), &signed, OutputFormat::Text).is_err());

        let public_key = hex::encode(
            SigningIdentity::ed25519(&seed, "Acme")
                .unwrap()
                .certificate
                .public_key,
        );
        let config = Config::from_toml_str(&format!(
            "[[signature.trusted_certificates]]\nsubject = \"Acme\"\nserial_number = \"01\"\nnot_before = \"2024-01-01T00:00:00Z\"\nnot_after = \"2099-01-01T00:00:00Z\"\npublic_key = \"{}\"\n",
            public_key
        ))
        .unwrap();
        assert!(handle_verify(&config, &signed, OutputFormat::Json).is_ok());
        assert!(handle_scan(&config, &signed, None, OutputFormat::Text).is_ok());
    }

    #[test]
    fn test_bad_attribute_rejected() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("seed.hex");
        fs::write(&key_path, hex::encode([1u8; 32])).unwrap();
        let artifact = dir.path().join("a.bin");
        fs::write(&artifact, b"x").unwrap();

        let err = handle_sign(
            &artifact,
            &key_path,
            "s",
            &["novalue".to_string()],
            None,
            OutputFormat::Text,
        );
        assert!(err.is_err());
    }
}
