//! Artifact trust validation
//!
//! Static risk scanning of plugin artifacts. Every check runs on every call
//! so the result always lists all findings:
//!
//! - **API scan**: dangerous import/call patterns (process spawning, dynamic
//!   evaluation, native FFI, recursive deletion, raw writes, credential access)
//! - **Obfuscation**: long machine-looking tokens repeated across many lines
//! - **Size**: artifacts above the configured byte threshold
//! - **Source**: allow-list / deny-list check of the download URL
//!
//! # Risk levels
//!
//! - Any `PrivilegeEscalation` finding or a denied source: `Dangerous`
//! - Any other finding: `Warning`
//! - No findings: `Safe`
//!
//! Validation calls and medium-or-worse findings are appended to an in-memory
//! audit log.

use chrono::{DateTime, Utc};
use regex::Regex;
use sdk::errors::PluginError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum audit entries retained; oldest are dropped first
const AUDIT_CAPACITY: usize = 1000;

/// Maximum findings reported per scan rule
const MAX_FINDINGS_PER_RULE: usize = 10;

/// Maximum evidence length in characters
const EVIDENCE_LIMIT: usize = 120;

/// Overall trust classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Warning,
    Dangerous,
}

/// Threat category of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreatType {
    PrivilegeEscalation,
    SuspiciousBehavior,
    DataExfiltration,
    Obfuscation,
    ResourceAbuse,
    UntrustedSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single scan finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustFinding {
    pub title: String,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub evidence: String,
    /// 1-based line of the evidence, when it comes from the artifact text
    pub line: Option<usize>,
}

/// Result of one validation call
#[derive(Debug, Clone, Serialize)]
pub struct SecurityValidationResult {
    pub overall_risk_level: RiskLevel,
    pub findings: Vec<TrustFinding>,
    pub is_valid: bool,
    /// Source URL matched the allow-list
    pub trusted_source: bool,
    /// BLAKE3 digest of the scanned bytes
    pub artifact_hash: String,
    pub scanned_at: DateTime<Utc>,
}

impl SecurityValidationResult {
    /// One-line summary of the worst findings, used in rejection errors
    pub fn summary(&self) -> String {
        let mut titles: Vec<&str> = self
            .findings
            .iter()
            .filter(|f| f.severity >= Severity::High)
            .map(|f| f.title.as_str())
            .collect();
        titles.dedup();
        if titles.is_empty() {
            format!("{:?} ({} findings)", self.overall_risk_level, self.findings.len())
        } else {
            format!("{:?}: {}", self.overall_risk_level, titles.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    ValidationCompleted,
    Finding,
    SourceDenied,
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub artifact: String,
    pub kind: AuditKind,
    pub severity: Option<Severity>,
    pub message: String,
}

/// Validator settings
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_artifact_bytes: u64,
    pub block_on_warning: bool,
    /// Hosts (or parent domains) whose artifacts are trusted
    pub trusted_sources: Vec<String>,
    /// Hosts (or parent domains) whose artifacts are always rejected
    pub denied_sources: Vec<String>,
    pub obfuscation_min_token_len: usize,
    pub obfuscation_repeat_lines: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 50 * 1024 * 1024,
            block_on_warning: false,
            trusted_sources: Vec::new(),
            denied_sources: Vec::new(),
            obfuscation_min_token_len: 40,
            obfuscation_repeat_lines: 5,
        }
    }
}

struct ScanRule {
    title: &'static str,
    threat_type: ThreatType,
    severity: Severity,
    pattern: Regex,
}

const RULES: &[(&str, ThreatType, Severity, &str)] = &[
    (
        "Process spawning",
        ThreatType::PrivilegeEscalation,
        Severity::Critical,
        r"\bProcess\.(run|runSync|start)\s*\(|std::process::Command|\bchild_process\b|\b(execvp?|execl|spawn|popen|system|ShellExecute[AW]?)\s*\(",
    ),
    (
        "Privileged command",
        ThreatType::PrivilegeEscalation,
        Severity::Critical,
        r"\bsudo\s|\bsetuid\s*\(|\bchmod\s+[0-7]*7[0-7]*\s|\brunas\s",
    ),
    (
        "Unrestricted file deletion",
        ThreatType::PrivilegeEscalation,
        Severity::High,
        r"\.delete(Sync)?\s*\(\s*recursive\s*:\s*true|\brm\s+-rf\b|\bremove_dir_all\s*\(|\brmtree\s*\(",
    ),
    (
        "Native code escape hatch",
        ThreatType::PrivilegeEscalation,
        Severity::High,
        r"dart:ffi|\bDynamicLibrary\.open\s*\(|\bdlopen\s*\(|\bLoadLibrary[AW]?\s*\(|\bctypes\.CDLL\b",
    ),
    (
        "Dynamic code execution",
        ThreatType::SuspiciousBehavior,
        Severity::High,
        r"\beval\s*\(|\bnew\s+Function\s*\(|\bFunction\.apply\s*\(",
    ),
    (
        "Reflection access",
        ThreatType::SuspiciousBehavior,
        Severity::Medium,
        r"dart:mirrors|\breflect(Class)?\s*\(|\bgetattr\s*\(",
    ),
    (
        "Raw file write",
        ThreatType::SuspiciousBehavior,
        Severity::Medium,
        r"\bwriteAs(Bytes|String)(Sync)?\s*\(|\bopenWrite\s*\(|std::fs::write|\bfs\.writeFile(Sync)?\s*\(",
    ),
    (
        "Credential access",
        ThreatType::DataExfiltration,
        Severity::High,
        r"\.ssh/|\bid_(rsa|ed25519)\b|\.aws/credentials|\bPlatform\.environment\b|\bprocess\.env\b",
    ),
    (
        "Raw network access",
        ThreatType::DataExfiltration,
        Severity::Medium,
        r"\b(Raw)?Socket\.connect\s*\(|\bXMLHttpRequest\b|\bWebSocket\.connect\s*\(",
    ),
];

/// Static artifact validator
pub struct ArtifactValidator {
    rules: Vec<ScanRule>,
    token_pattern: Regex,
    config: ValidatorConfig,
    audit: Mutex<VecDeque<AuditEntry>>,
}

impl ArtifactValidator {
    /// Create a validator with the built-in scan rules
    ///
    /// # Errors
    ///
    /// Returns `PluginError::Config` if the obfuscation token length is zero.
    pub fn new(config: ValidatorConfig) -> Result<Self, PluginError> {
        if config.obfuscation_min_token_len == 0 {
            return Err(PluginError::Config(
                "obfuscation_min_token_len must be greater than zero".to_string(),
            ));
        }

        let mut rules = Vec::with_capacity(RULES.len());
        for (title, threat_type, severity, pattern) in RULES {
            let pattern = Regex::new(pattern).map_err(|e| {
                PluginError::Internal(format!("scan rule '{}' failed to compile: {}", title, e))
            })?;
            rules.push(ScanRule {
                title,
                threat_type: *threat_type,
                severity: *severity,
                pattern,
            });
        }

        let token_pattern = Regex::new(&format!(
            r"[A-Za-z0-9_$+/=]{{{},}}",
            config.obfuscation_min_token_len
        ))
        .map_err(|e| PluginError::Config(format!("invalid obfuscation settings: {}", e)))?;

        Ok(Self {
            rules,
            token_pattern,
            config,
            audit: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate an artifact
    ///
    /// `path` only labels findings and audit entries; the bytes are the
    /// sole input to the scan.
    pub fn validate(
        &self,
        path: &str,
        bytes: &[u8],
        source_url: Option<&str>,
    ) -> SecurityValidationResult {
        self.validate_audited(path, bytes, source_url).0
    }

    /// Validate an artifact and also return the audit entries this call appended
    pub fn validate_audited(
        &self,
        path: &str,
        bytes: &[u8],
        source_url: Option<&str>,
    ) -> (SecurityValidationResult, Vec<AuditEntry>) {
        debug!("Validating artifact {} ({} bytes)", path, bytes.len());

        let text = String::from_utf8_lossy(bytes);
        let mut findings = self.scan_patterns(&text);
        findings.extend(self.check_obfuscation(&text));
        findings.extend(self.check_size(bytes.len() as u64));

        let (source_findings, trusted_source, denied) = match source_url {
            Some(url) => self.check_source(url),
            None => (Vec::new(), false, false),
        };
        findings.extend(source_findings);

        let dangerous = denied
            || findings
                .iter()
                .any(|f| f.threat_type == ThreatType::PrivilegeEscalation);

        let overall_risk_level = if dangerous {
            RiskLevel::Dangerous
        } else if !findings.is_empty() {
            RiskLevel::Warning
        } else {
            RiskLevel::Safe
        };

        let is_valid = match overall_risk_level {
            RiskLevel::Dangerous => false,
            RiskLevel::Warning => !self.config.block_on_warning,
            RiskLevel::Safe => true,
        };

        let result = SecurityValidationResult {
            overall_risk_level,
            findings,
            is_valid,
            trusted_source,
            artifact_hash: blake3::hash(bytes).to_hex().to_string(),
            scanned_at: Utc::now(),
        };

        let audit = self.record_audit(path, &result, denied);

        match result.overall_risk_level {
            RiskLevel::Dangerous => warn!("Artifact {} rejected: {}", path, result.summary()),
            RiskLevel::Warning => warn!(
                "Artifact {} passed with {} warnings",
                path,
                result.findings.len()
            ),
            RiskLevel::Safe => info!("Artifact {} passed security validation", path),
        }

        (result, audit)
    }

    fn scan_patterns(&self, text: &str) -> Vec<TrustFinding> {
        let mut findings = Vec::new();
        let mut per_rule: HashMap<&str, usize> = HashMap::new();

        for (index, line) in text.lines().enumerate() {
            for rule in &self.rules {
                if !rule.pattern.is_match(line) {
                    continue;
                }
                let count = per_rule.entry(rule.title).or_insert(0);
                if *count >= MAX_FINDINGS_PER_RULE {
                    continue;
                }
                *count += 1;
                findings.push(TrustFinding {
                    title: rule.title.to_string(),
                    threat_type: rule.threat_type,
                    severity: rule.severity,
                    evidence: truncate(line.trim()),
                    line: Some(index + 1),
                });
            }
        }

        findings
    }

    fn check_obfuscation(&self, text: &str) -> Option<TrustFinding> {
        // token -> distinct lines it appears on
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        let mut lines_with_tokens = 0usize;
        let mut non_empty_lines = 0usize;

        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            non_empty_lines += 1;

            let mut seen_on_line = HashSet::new();
            for m in self.token_pattern.find_iter(line) {
                if seen_on_line.insert(m.as_str()) {
                    *occurrences.entry(m.as_str()).or_insert(0) += 1;
                }
            }
            if !seen_on_line.is_empty() {
                lines_with_tokens += 1;
            }
        }

        let threshold = self.config.obfuscation_repeat_lines.max(1);
        let most_repeated = occurrences
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(token, count)| (*token, *count));

        if let Some((token, count)) = most_repeated {
            if count >= threshold {
                return Some(TrustFinding {
                    title: "Obfuscated payload".to_string(),
                    threat_type: ThreatType::Obfuscation,
                    severity: Severity::Medium,
                    evidence: format!(
                        "token {}... ({} chars) repeated on {} lines",
                        token.chars().take(24).collect::<String>(),
                        token.len(),
                        count
                    ),
                    line: None,
                });
            }
        }

        // Dense long tokens on most lines also look machine-generated
        if lines_with_tokens >= threshold && lines_with_tokens * 2 > non_empty_lines {
            return Some(TrustFinding {
                title: "Obfuscated payload".to_string(),
                threat_type: ThreatType::Obfuscation,
                severity: Severity::Medium,
                evidence: format!(
                    "{} of {} lines contain tokens of {}+ characters",
                    lines_with_tokens, non_empty_lines, self.config.obfuscation_min_token_len
                ),
                line: None,
            });
        }

        None
    }

    fn check_size(&self, size: u64) -> Option<TrustFinding> {
        if size <= self.config.max_artifact_bytes {
            return None;
        }
        Some(TrustFinding {
            title: "Oversized artifact".to_string(),
            threat_type: ThreatType::ResourceAbuse,
            severity: Severity::Medium,
            evidence: format!(
                "{} bytes exceeds limit of {} bytes",
                size, self.config.max_artifact_bytes
            ),
            line: None,
        })
    }

    /// Returns `(findings, trusted, denied)`
    fn check_source(&self, source_url: &str) -> (Vec<TrustFinding>, bool, bool) {
        let parsed = match url::Url::parse(source_url) {
            Ok(u) => u,
            Err(e) => {
                return (
                    vec![TrustFinding {
                        title: "Unparsable source URL".to_string(),
                        threat_type: ThreatType::UntrustedSource,
                        severity: Severity::Medium,
                        evidence: format!("{}: {}", truncate(source_url), e),
                        line: None,
                    }],
                    false,
                    false,
                )
            }
        };

        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        if host_matches(&host, &self.config.denied_sources) {
            return (
                vec![TrustFinding {
                    title: "Denied source".to_string(),
                    threat_type: ThreatType::UntrustedSource,
                    severity: Severity::Critical,
                    evidence: truncate(source_url),
                    line: None,
                }],
                false,
                true,
            );
        }

        if host_matches(&host, &self.config.trusted_sources) {
            return (Vec::new(), true, false);
        }

        if parsed.scheme() == "http" {
            return (
                vec![TrustFinding {
                    title: "Insecure transport".to_string(),
                    threat_type: ThreatType::UntrustedSource,
                    severity: Severity::Low,
                    evidence: truncate(source_url),
                    line: None,
                }],
                false,
                false,
            );
        }

        (Vec::new(), false, false)
    }

    fn record_audit(
        &self,
        path: &str,
        result: &SecurityValidationResult,
        denied: bool,
    ) -> Vec<AuditEntry> {
        let now = result.scanned_at;
        let mut entries = vec![AuditEntry {
            timestamp: now,
            artifact: path.to_string(),
            kind: AuditKind::ValidationCompleted,
            severity: None,
            message: format!(
                "{:?}, {} findings, blake3:{}",
                result.overall_risk_level,
                result.findings.len(),
                result.artifact_hash
            ),
        }];

        if denied {
            entries.push(AuditEntry {
                timestamp: now,
                artifact: path.to_string(),
                kind: AuditKind::SourceDenied,
                severity: Some(Severity::Critical),
                message: "source URL is on the deny-list".to_string(),
            });
        }

        for finding in result.findings.iter().filter(|f| f.severity >= Severity::Medium) {
            entries.push(AuditEntry {
                timestamp: now,
                artifact: path.to_string(),
                kind: AuditKind::Finding,
                severity: Some(finding.severity),
                message: format!("{}: {}", finding.title, finding.evidence),
            });
        }

        let mut audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        audit.extend(entries.iter().cloned());
        while audit.len() > AUDIT_CAPACITY {
            audit.pop_front();
        }

        entries
    }

    /// Snapshot of the audit log, oldest first
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_audit_log(&self) {
        self.audit.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn host_matches(host: &str, entries: &[String]) -> bool {
    !host.is_empty()
        && entries.iter().any(|entry| {
            let entry = entry.trim().trim_start_matches("*.").to_ascii_lowercase();
            host == entry || host.ends_with(&format!(".{}", entry))
        })
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= EVIDENCE_LIMIT {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(EVIDENCE_LIMIT).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ArtifactValidator {
        ArtifactValidator::new(ValidatorConfig::default()).unwrap()
    }

    #[test]
    fn test_clean_artifact_is_safe() {
        let v = validator();
        let result = v.validate("clock.dart", b"void main() {\n  print('tick');\n}\n", None);
        assert_eq!(result.overall_risk_level, RiskLevel::Safe);
        assert!(result.is_valid);
        assert!(result.findings.is_empty());
        assert_eq!(result.artifact_hash.len(), 64);
    }

    #[test]
    fn test_process_spawn_and_file_write_is_dangerous() {
        let v = validator();
        let code = b"import 'dart:io';\nawait Process.run('sh', ['-c', 'x']);\nFile(p).writeAsStringSync(data);\n";
        let result = v.validate("evil.dart", code, None);
        assert_eq!(result.overall_risk_level, RiskLevel::Dangerous);
        assert!(!result.is_valid);
        let titles: Vec<&str> = result.findings.iter().map(|f| f.title.as_str()).collect();
        assert!(titles.contains(&"Process spawning"));
        assert!(titles.contains(&"Raw file write"));
        assert_eq!(result.findings[0].line, Some(2));
    }

    #[test]
    fn test_non_escalation_findings_are_warning() {
        let v = validator();
        let result = v.validate("calc.js", b"const x = eval(input);\n", None);
        assert_eq!(result.overall_risk_level, RiskLevel::Warning);
        assert!(result.is_valid);
    }

    #[test]
    fn test_block_on_warning() {
        let v = ArtifactValidator::new(ValidatorConfig {
            block_on_warning: true,
            ..ValidatorConfig::default()
        })
        .unwrap();
        let result = v.validate("calc.js", b"eval(x)", None);
        assert_eq!(result.overall_risk_level, RiskLevel::Warning);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_does_not_short_circuit() {
        let v = validator();
        let code = b"eval(a)\nProcess.start('x')\nrm -rf /\n";
        let result = v.validate("multi", code, Some("http://example.org/p.zip"));
        assert!(result.findings.len() >= 4);
    }

    #[test]
    fn test_obfuscation_heuristic() {
        let v = validator();
        let token = "aGVsbG8gd29ybGQgaGVsbG8gd29ybGQgaGVsbG8gd29ybGQ";
        let mut code = String::new();
        for i in 0..6 {
            code.push_str(&format!("var v{} = decode('{}');\n", i, token));
        }
        let result = v.validate("obf.js", code.as_bytes(), None);
        assert!(result
            .findings
            .iter()
            .any(|f| f.threat_type == ThreatType::Obfuscation));
        assert_eq!(result.overall_risk_level, RiskLevel::Warning);
    }

    #[test]
    fn test_short_tokens_are_not_obfuscation() {
        let v = validator();
        let code = "let value = compute();\n".repeat(20);
        let result = v.validate("plain.js", code.as_bytes(), None);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn test_size_threshold() {
        let v = ArtifactValidator::new(ValidatorConfig {
            max_artifact_bytes: 8,
            ..ValidatorConfig::default()
        })
        .unwrap();
        let result = v.validate("big.bin", b"0123456789", None);
        assert_eq!(result.findings[0].threat_type, ThreatType::ResourceAbuse);
        assert_eq!(result.overall_risk_level, RiskLevel::Warning);
    }

    #[test]
    fn test_source_lists() {
        let v = ArtifactValidator::new(ValidatorConfig {
            trusted_sources: vec!["plugins.example.com".to_string()],
            denied_sources: vec!["evil.test".to_string()],
            ..ValidatorConfig::default()
        })
        .unwrap();

        let trusted = v.validate("a", b"ok", Some("https://plugins.example.com/a.zip"));
        assert!(trusted.trusted_source);
        assert_eq!(trusted.overall_risk_level, RiskLevel::Safe);

        let denied = v.validate("b", b"ok", Some("https://cdn.evil.test/b.zip"));
        assert_eq!(denied.overall_risk_level, RiskLevel::Dangerous);
        assert!(!denied.is_valid);

        let insecure = v.validate("c", b"ok", Some("http://mirror.org/c.zip"));
        assert_eq!(insecure.overall_risk_level, RiskLevel::Warning);

        let garbage = v.validate("d", b"ok", Some("not a url"));
        assert_eq!(garbage.findings[0].title, "Unparsable source URL");
    }

    #[test]
    fn test_audit_log_records_calls_and_findings() {
        let v = validator();
        v.validate("a", b"fine", None);
        v.validate("b", b"Process.run('x')", None);

        let log = v.audit_log();
        let completed = log
            .iter()
            .filter(|e| e.kind == AuditKind::ValidationCompleted)
            .count();
        assert_eq!(completed, 2);
        assert!(log
            .iter()
            .any(|e| e.kind == AuditKind::Finding && e.severity == Some(Severity::Critical)));

        let (_, own) = v.validate_audited("c", b"fine", None);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].artifact, "c");

        v.clear_audit_log();
        assert!(v.audit_log().is_empty());
    }

    #[test]
    fn test_results_are_not_cached() {
        let v = validator();
        let first = v.validate("p", b"fine", None);
        let second = v.validate("p", b"Process.run('x')", None);
        assert_ne!(first.artifact_hash, second.artifact_hash);
        assert_ne!(first.overall_risk_level, second.overall_risk_level);
    }
}
