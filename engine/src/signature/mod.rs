//! Signature verification
//!
//! Verifies the signature block embedded at the end of a plugin artifact and
//! produces signed artifacts that the same verifier round-trips.
//!
//! # Block format
//!
//! ```text
//! payload || block JSON || block length (u32 LE) || "WRDNSIG1"
//! ```
//!
//! The block lists one or more signature entries (co-signing). Each entry
//! names its algorithm, the fingerprint of the signing certificate, the
//! SHA-256 digest of the payload, the signed attributes and an optional
//! timestamp token. The signature covers the digest, the canonical
//! attributes JSON and the timestamp token.
//!
//! # Trust
//!
//! A signature is trusted only when its certificate is in the trust store
//! and currently valid, the digest matches, the cryptographic check passes,
//! and any timestamp comes from a trusted timestamp authority. An artifact
//! with signatures is valid only if at least one of them is trusted.

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sdk::errors::PluginError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Trailing magic marking a signed artifact
pub const SIGNATURE_MAGIC: &[u8; 8] = b"WRDNSIG1";

const TRAILER_LEN: usize = 4 + SIGNATURE_MAGIC.len();

const BLOCK_FORMAT_VERSION: u32 = 1;

/// Whether signatures are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    Required,
    Optional,
    Disabled,
}

impl FromStr for SignaturePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "required" => Ok(SignaturePolicy::Required),
            "optional" => Ok(SignaturePolicy::Optional),
            "disabled" => Ok(SignaturePolicy::Disabled),
            other => Err(format!("unknown signature policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationStatus {
    Valid,
    Revoked,
    Unknown,
}

/// Signing certificate known to the trust store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// BLAKE3 hex digest of the public key
    pub fingerprint: String,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub revocation_status: RevocationStatus,
}

impl CertificateInfo {
    pub fn new(
        subject: impl Into<String>,
        issuer: impl Into<String>,
        serial_number: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        public_key: Vec<u8>,
    ) -> Self {
        Self {
            subject: subject.into(),
            issuer: issuer.into(),
            serial_number: serial_number.into(),
            not_before,
            not_after,
            fingerprint: fingerprint(&public_key),
            public_key,
            revocation_status: RevocationStatus::Valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.revocation_status == RevocationStatus::Valid
            && self.not_before <= now
            && now <= self.not_after
    }
}

/// Certificate fingerprint for a public key
pub fn fingerprint(public_key: &[u8]) -> String {
    blake3::hash(public_key).to_hex().to_string()
}

/// Pluggable signature algorithm
pub trait CryptoProvider: Send + Sync {
    /// Algorithm tag stored in signature entries
    fn algorithm(&self) -> &'static str;

    /// Derive the public key for a secret key
    fn public_key(&self, secret: &[u8]) -> Result<Vec<u8>, PluginError>;

    fn sign(&self, secret: &[u8], message: &[u8]) -> Result<Vec<u8>, PluginError>;

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 provider; secrets are 32-byte seeds
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Provider;

impl Ed25519Provider {
    fn signing_key(secret: &[u8]) -> Result<SigningKey, PluginError> {
        let seed: [u8; 32] = secret.try_into().map_err(|_| {
            PluginError::Config(format!(
                "Invalid Ed25519 seed length: expected 32, got {}",
                secret.len()
            ))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

impl CryptoProvider for Ed25519Provider {
    fn algorithm(&self) -> &'static str {
        "ed25519"
    }

    fn public_key(&self, secret: &[u8]) -> Result<Vec<u8>, PluginError> {
        Ok(Self::signing_key(secret)?.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, secret: &[u8], message: &[u8]) -> Result<Vec<u8>, PluginError> {
        let key = Self::signing_key(secret)?;
        Ok(key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

/// Timestamp token attached to a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampToken {
    pub authority: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignatureEntry {
    algorithm: String,
    certificate: String,
    digest: String,
    signature: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    timestamp: Option<TimestampToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignatureBlock {
    format: u32,
    signatures: Vec<SignatureEntry>,
}

impl SignatureBlock {
    fn empty() -> Self {
        Self {
            format: BLOCK_FORMAT_VERSION,
            signatures: Vec::new(),
        }
    }
}

/// One signature found in an artifact
#[derive(Debug, Clone, Serialize)]
pub struct SignatureInfo {
    pub algorithm: String,
    pub certificate_fingerprint: String,
    /// Trust store entry, if the certificate is known
    pub certificate: Option<CertificateInfo>,
    pub timestamp: Option<TimestampToken>,
    pub attributes: BTreeMap<String, String>,
    pub trusted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignatureVerificationResult {
    pub is_valid: bool,
    pub has_signature: bool,
    pub signatures: Vec<SignatureInfo>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Key material used by `SignatureVerifier::sign`
#[derive(Clone)]
pub struct SigningIdentity {
    secret: Vec<u8>,
    pub certificate: CertificateInfo,
    pub algorithm: String,
    /// Authority recorded in timestamp tokens, if any
    pub timestamp_authority: Option<String>,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("certificate", &self.certificate.fingerprint)
            .field("algorithm", &self.algorithm)
            .field("timestamp_authority", &self.timestamp_authority)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Ed25519 identity from a 32-byte seed, valid for one year
    pub fn ed25519(seed: &[u8], subject: impl Into<String>) -> Result<Self, PluginError> {
        let provider = Ed25519Provider;
        let public_key = provider.public_key(seed)?;
        let now = Utc::now();
        let subject = subject.into();
        let certificate = CertificateInfo::new(
            subject.clone(),
            subject,
            hex::encode(&public_key[..8]),
            now - Duration::days(1),
            now + Duration::days(365),
            public_key,
        );
        Ok(Self {
            secret: seed.to_vec(),
            certificate,
            algorithm: provider.algorithm().to_string(),
            timestamp_authority: None,
        })
    }

    pub fn with_timestamp_authority(mut self, authority: impl Into<String>) -> Self {
        self.timestamp_authority = Some(authority.into());
        self
    }
}

/// Split a signed artifact into payload and block
///
/// Returns `Ok(None)` when the artifact carries no trailer.
fn split_block(bytes: &[u8]) -> Result<Option<(&[u8], SignatureBlock)>, String> {
    if bytes.len() < TRAILER_LEN || !bytes.ends_with(SIGNATURE_MAGIC) {
        return Ok(None);
    }

    let len_start = bytes.len() - TRAILER_LEN;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[len_start..len_start + 4]);
    let block_len = u32::from_le_bytes(len_bytes) as usize;

    if block_len > len_start {
        return Err(format!(
            "signature block length {} exceeds artifact size",
            block_len
        ));
    }

    let block_start = len_start - block_len;
    let block: SignatureBlock = serde_json::from_slice(&bytes[block_start..len_start])
        .map_err(|e| format!("malformed signature block: {}", e))?;

    if block.format != BLOCK_FORMAT_VERSION {
        return Err(format!("unsupported signature block format {}", block.format));
    }

    Ok(Some((&bytes[..block_start], block)))
}

fn append_block(payload: &[u8], block: &SignatureBlock) -> Result<Vec<u8>, PluginError> {
    let json = serde_json::to_vec(block)
        .map_err(|e| PluginError::Internal(format!("failed to encode signature block: {}", e)))?;
    let len = u32::try_from(json.len())
        .map_err(|_| PluginError::Internal("signature block too large".to_string()))?;

    let mut out = Vec::with_capacity(payload.len() + json.len() + TRAILER_LEN);
    out.extend_from_slice(payload);
    out.extend_from_slice(&json);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(SIGNATURE_MAGIC);
    Ok(out)
}

/// Return the payload of a possibly signed artifact
///
/// Unsigned or malformed input is returned unchanged.
pub fn strip_signature(bytes: &[u8]) -> &[u8] {
    match split_block(bytes) {
        Ok(Some((payload, _))) => payload,
        _ => bytes,
    }
}

fn payload_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Bytes covered by a signature entry
fn signed_message(
    digest: &str,
    attributes: &BTreeMap<String, String>,
    timestamp: Option<&TimestampToken>,
) -> Result<Vec<u8>, PluginError> {
    let encode = |e: serde_json::Error| {
        PluginError::Internal(format!("failed to encode signed attributes: {}", e))
    };
    let mut message = digest.as_bytes().to_vec();
    message.push(b'\n');
    message.extend(serde_json::to_vec(attributes).map_err(encode)?);
    if let Some(token) = timestamp {
        message.push(b'\n');
        message.extend(serde_json::to_vec(token).map_err(encode)?);
    }
    Ok(message)
}

/// Artifact signature verifier and signer
pub struct SignatureVerifier {
    policy: RwLock<SignaturePolicy>,
    providers: HashMap<String, Arc<dyn CryptoProvider>>,
    certificates: RwLock<HashMap<String, CertificateInfo>>,
    trusted_authorities: RwLock<HashSet<String>>,
    identity: RwLock<Option<SigningIdentity>>,
}

impl SignatureVerifier {
    /// Create a verifier with the Ed25519 provider registered
    pub fn new(policy: SignaturePolicy) -> Self {
        let mut verifier = Self {
            policy: RwLock::new(policy),
            providers: HashMap::new(),
            certificates: RwLock::new(HashMap::new()),
            trusted_authorities: RwLock::new(HashSet::new()),
            identity: RwLock::new(None),
        };
        verifier.register_provider(Arc::new(Ed25519Provider));
        verifier
    }

    pub fn register_provider(&mut self, provider: Arc<dyn CryptoProvider>) {
        self.providers
            .insert(provider.algorithm().to_string(), provider);
    }

    pub fn policy(&self) -> SignaturePolicy {
        *self.policy.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_policy(&self, policy: SignaturePolicy) {
        info!("Signature policy set to {:?}", policy);
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Add a certificate to the trust store, replacing any entry with the same fingerprint
    pub fn trust_certificate(&self, certificate: CertificateInfo) {
        debug!(
            "Trusting certificate {} ({})",
            certificate.subject, certificate.fingerprint
        );
        self.certificates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(certificate.fingerprint.clone(), certificate);
    }

    /// Mark a certificate revoked; returns false if it is unknown
    pub fn revoke_certificate(&self, fingerprint: &str) -> bool {
        let mut certificates = self.certificates.write().unwrap_or_else(|e| e.into_inner());
        match certificates.get_mut(fingerprint) {
            Some(cert) => {
                warn!("Certificate {} ({}) revoked", cert.subject, fingerprint);
                cert.revocation_status = RevocationStatus::Revoked;
                true
            }
            None => false,
        }
    }

    pub fn certificate(&self, fingerprint: &str) -> Option<CertificateInfo> {
        self.certificates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint)
            .cloned()
    }

    pub fn trust_timestamp_authority(&self, authority: impl Into<String>) {
        self.trusted_authorities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(authority.into());
    }

    /// Set the identity used by `sign`; its certificate is trusted as well
    pub fn set_signing_identity(&self, identity: SigningIdentity) -> Result<(), PluginError> {
        if !self.providers.contains_key(&identity.algorithm) {
            return Err(PluginError::Config(format!(
                "no crypto provider for algorithm '{}'",
                identity.algorithm
            )));
        }
        self.trust_certificate(identity.certificate.clone());
        if let Some(authority) = &identity.timestamp_authority {
            self.trust_timestamp_authority(authority.clone());
        }
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity);
        Ok(())
    }

    /// Append a signature over `bytes` using the signing identity
    ///
    /// Signing an already signed artifact adds a co-signature over the same
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::Config` if no signing identity is set. Input
    /// whose trailer is not a well-formed block is signed as plain payload.
    pub fn sign(
        &self,
        bytes: &[u8],
        attributes: BTreeMap<String, String>,
    ) -> Result<Vec<u8>, PluginError> {
        let identity = self
            .identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| PluginError::Config("no signing identity configured".to_string()))?;

        let provider = self.providers.get(&identity.algorithm).ok_or_else(|| {
            PluginError::Config(format!(
                "no crypto provider for algorithm '{}'",
                identity.algorithm
            ))
        })?;

        let (payload, mut block) = match split_block(bytes) {
            Ok(Some((payload, block))) => (payload, block),
            Ok(None) => (bytes, SignatureBlock::empty()),
            Err(e) => {
                // Trailing bytes that only look like a block are payload
                debug!("Signing whole input, no usable block: {}", e);
                (bytes, SignatureBlock::empty())
            }
        };

        let digest = payload_digest(payload);
        let timestamp = identity
            .timestamp_authority
            .as_ref()
            .map(|authority| TimestampToken {
                authority: authority.clone(),
                time: Utc::now(),
            });
        let message = signed_message(&digest, &attributes, timestamp.as_ref())?;
        let signature = provider.sign(&identity.secret, &message)?;

        block.signatures.push(SignatureEntry {
            algorithm: identity.algorithm.clone(),
            certificate: identity.certificate.fingerprint.clone(),
            digest,
            signature: hex::encode(signature),
            attributes,
            timestamp,
        });

        debug!(
            "Signed {} byte payload with {} ({} signatures)",
            payload.len(),
            identity.certificate.subject,
            block.signatures.len()
        );

        append_block(payload, &block)
    }

    /// Verify the embedded signatures of an artifact
    pub fn verify(&self, path: &str, bytes: &[u8]) -> SignatureVerificationResult {
        let policy = self.policy();
        let mut result = SignatureVerificationResult::default();

        let split = split_block(bytes);
        result.has_signature = !matches!(split, Ok(None));

        if policy == SignaturePolicy::Disabled {
            result.is_valid = true;
            result
                .warnings
                .push("signature verification disabled by policy".to_string());
            debug!("Skipping signature verification for {}", path);
            return result;
        }

        let (payload, block) = match split {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                match policy {
                    SignaturePolicy::Required => {
                        result.is_valid = false;
                        result
                            .errors
                            .push("artifact is not signed and signatures are required".to_string());
                        warn!("Unsigned artifact {} rejected", path);
                    }
                    _ => {
                        result.is_valid = true;
                        result.warnings.push("artifact is not signed".to_string());
                    }
                }
                return result;
            }
            Err(e) => {
                result.is_valid = false;
                result.errors.push(e);
                warn!("Artifact {} has an unreadable signature block", path);
                return result;
            }
        };

        if block.signatures.is_empty() {
            result.is_valid = false;
            result
                .errors
                .push("signature block contains no signatures".to_string());
            return result;
        }

        let digest = payload_digest(payload);
        let now = Utc::now();

        for (index, entry) in block.signatures.iter().enumerate() {
            let (info, error) = self.check_entry(entry, &digest, now);
            if let Some(error) = error {
                result.errors.push(format!("signature {}: {}", index + 1, error));
            }
            result.signatures.push(info);
        }

        result.is_valid = result.signatures.iter().any(|s| s.trusted);

        if result.is_valid {
            // Untrusted co-signatures do not fail an artifact that has a trusted one
            let untrusted = std::mem::take(&mut result.errors);
            result.warnings.extend(untrusted);
            info!(
                "Signature verified for {} ({} signatures)",
                path,
                result.signatures.len()
            );
        } else {
            warn!(
                "Signature verification failed for {}: {}",
                path,
                result.errors.join("; ")
            );
        }

        result
    }

    fn check_entry(
        &self,
        entry: &SignatureEntry,
        digest: &str,
        now: DateTime<Utc>,
    ) -> (SignatureInfo, Option<String>) {
        let certificate = self.certificate(&entry.certificate);
        let mut info = SignatureInfo {
            algorithm: entry.algorithm.clone(),
            certificate_fingerprint: entry.certificate.clone(),
            certificate: certificate.clone(),
            timestamp: entry.timestamp.clone(),
            attributes: entry.attributes.clone(),
            trusted: false,
        };

        let Some(certificate) = certificate else {
            return (info, Some(format!("unknown certificate {}", entry.certificate)));
        };
        if certificate.revocation_status != RevocationStatus::Valid {
            return (
                info,
                Some(format!("certificate {} is revoked", certificate.subject)),
            );
        }
        if !certificate.is_valid_at(now) {
            return (
                info,
                Some(format!(
                    "certificate {} is outside its validity window",
                    certificate.subject
                )),
            );
        }
        if entry.digest != digest {
            return (info, Some("payload digest mismatch".to_string()));
        }

        let Some(provider) = self.providers.get(&entry.algorithm) else {
            return (
                info,
                Some(format!("unsupported algorithm '{}'", entry.algorithm)),
            );
        };
        let Ok(signature) = hex::decode(&entry.signature) else {
            return (info, Some("signature is not valid hex".to_string()));
        };
        let message = match signed_message(digest, &entry.attributes, entry.timestamp.as_ref()) {
            Ok(m) => m,
            Err(e) => return (info, Some(e.to_string())),
        };
        if !provider.verify(&certificate.public_key, &message, &signature) {
            return (info, Some("cryptographic check failed".to_string()));
        }

        if let Some(token) = &entry.timestamp {
            let trusted = self
                .trusted_authorities
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&token.authority);
            if !trusted {
                return (
                    info,
                    Some(format!(
                        "timestamp authority '{}' is not trusted",
                        token.authority
                    )),
                );
            }
        }

        info.trusted = true;
        (info, None)
    }
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}
