use sdk::types::Permission;
use std::collections::BTreeSet;
use warden_engine::permissions::{classify_risk, dangerous_combinations, PermissionRisk};
use warden_engine::signature::{SignaturePolicy, SignatureVerifier, SigningIdentity};
use warden_engine::trust::{ArtifactValidator, RiskLevel, ThreatType, ValidatorConfig};

#[test]
fn test_spawn_plus_file_write_is_dangerous() {
    let validator = ArtifactValidator::new(ValidatorConfig::default()).unwrap();
    let artifact = b"import 'dart:io';\nProcess.run('curl', [url]);\nFile('/etc/hosts').writeAsStringSync(x);\n";

    let result = validator.validate("dropper.dart", artifact, None);
    assert_eq!(result.overall_risk_level, RiskLevel::Dangerous);
    assert!(!result.is_valid);
    assert!(result
        .findings
        .iter()
        .any(|f| f.threat_type == ThreatType::PrivilegeEscalation && f.line == Some(2)));
    assert!(result.findings.iter().any(|f| f.line == Some(3)));
}

#[test]
fn test_denied_source_blocks_clean_artifact() {
    let validator = ArtifactValidator::new(ValidatorConfig {
        denied_sources: vec!["evil.example.com".to_string()],
        trusted_sources: vec!["plugins.example.org".to_string()],
        ..ValidatorConfig::default()
    })
    .unwrap();

    let blocked = validator.validate(
        "clean.js",
        b"console.log('hi')",
        Some("https://cdn.evil.example.com/clean.js"),
    );
    assert!(!blocked.is_valid);
    assert!(!blocked.trusted_source);

    let trusted = validator.validate(
        "clean.js",
        b"console.log('hi')",
        Some("https://plugins.example.org/clean.js"),
    );
    assert!(trusted.is_valid);
    assert!(trusted.trusted_source);
}

#[test]
fn test_dangerous_permission_pairs() {
    let set: BTreeSet<Permission> = [Permission::Camera, Permission::Network]
        .into_iter()
        .collect();
    assert_eq!(
        dangerous_combinations(&set),
        vec![(Permission::Camera, Permission::Network)]
    );
    assert_eq!(classify_risk(&set), PermissionRisk::High);

    let benign: BTreeSet<Permission> = [Permission::Notifications, Permission::Storage]
        .into_iter()
        .collect();
    assert!(dangerous_combinations(&benign).is_empty());
    assert_eq!(classify_risk(&benign), PermissionRisk::Low);
}

#[test]
fn test_signature_from_revoked_signer_rejected() {
    let verifier = SignatureVerifier::new(SignaturePolicy::Required);
    let identity = SigningIdentity::ed25519(&[9u8; 32], "Former Publisher").unwrap();
    let fingerprint = identity.certificate.fingerprint.clone();
    verifier.set_signing_identity(identity).unwrap();

    let signed = verifier.sign(b"payload", Default::default()).unwrap();
    assert!(verifier.verify("a.bin", &signed).is_valid);

    assert!(verifier.revoke_certificate(&fingerprint));
    let result = verifier.verify("a.bin", &signed);
    assert!(!result.is_valid);
    assert!(!result.errors.is_empty());
}
