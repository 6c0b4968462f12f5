//! Version constraint engine
//!
//! Matches constraint expressions against plain `MAJOR.MINOR.PATCH`
//! versions. Supported clauses:
//!
//! - exact: `1.0.0` or `=1.0.0`
//! - caret: `^1.2.0` (same leading non-zero component, `>=` the base)
//! - tilde: `~1.2.0` (same major and minor, `>=` the base)
//! - comparisons: `>=`, `>`, `<=`, `<`
//! - wildcard: `*`
//!
//! Clauses separated by whitespace or commas are combined with logical AND.
//! Matching fails closed: anything unparsable yields `false`, never a match.

use semver::{Comparator, Op, Version};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Parse a plain `MAJOR.MINOR.PATCH` version
///
/// Pre-release and build suffixes are rejected since their segments are not
/// plain non-negative integers.
pub fn parse_version(input: &str) -> Option<Version> {
    let version = Version::parse(input.trim()).ok()?;
    if !version.pre.is_empty() || !version.build.is_empty() {
        return None;
    }
    Some(version)
}

/// A single constraint clause
#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Any,
    Compare(Comparator),
}

impl Clause {
    fn matches(&self, version: &Version) -> bool {
        match self {
            Clause::Any => true,
            Clause::Compare(cmp) => cmp.matches(version),
        }
    }
}

/// Parsed constraint expression (AND of clauses)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    clauses: Vec<Clause>,
}

/// Why a constraint could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version constraint: {0}")]
pub struct ConstraintError(pub String);

const OPERATORS: [&str; 7] = [">=", "<=", ">", "<", "=", "^", "~"];

impl FromStr for VersionConstraint {
    type Err = ConstraintError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = input
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() {
            return Err(ConstraintError("empty constraint".to_string()));
        }

        let mut clauses = Vec::with_capacity(tokens.len());
        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            // Allow a detached operator such as ">= 1.0.0"
            let clause_text = if OPERATORS.contains(&token) {
                let version = iter
                    .next()
                    .ok_or_else(|| ConstraintError(format!("operator '{}' without version", token)))?;
                format!("{}{}", token, version)
            } else {
                token.to_string()
            };
            clauses.push(parse_clause(&clause_text)?);
        }

        Ok(Self {
            raw: input.trim().to_string(),
            clauses,
        })
    }
}

fn parse_clause(text: &str) -> Result<Clause, ConstraintError> {
    if text == "*" {
        return Ok(Clause::Any);
    }

    // A bare version means exact match, unlike semver's implicit caret
    let normalized = if text.starts_with(|c: char| c.is_ascii_digit()) {
        format!("={}", text)
    } else {
        text.to_string()
    };

    let cmp = Comparator::parse(&normalized)
        .map_err(|e| ConstraintError(format!("'{}': {}", text, e)))?;

    if cmp.minor.is_none() || cmp.patch.is_none() {
        return Err(ConstraintError(format!(
            "'{}' must name a full MAJOR.MINOR.PATCH version",
            text
        )));
    }
    if !cmp.pre.is_empty() {
        return Err(ConstraintError(format!("'{}' has a pre-release suffix", text)));
    }

    match cmp.op {
        Op::Exact | Op::Greater | Op::GreaterEq | Op::Less | Op::LessEq | Op::Tilde | Op::Caret => {
            Ok(Clause::Compare(cmp))
        }
        _ => Err(ConstraintError(format!("'{}' uses an unsupported operator", text))),
    }
}

impl VersionConstraint {
    pub fn parse(input: &str) -> Result<Self, ConstraintError> {
        input.parse()
    }

    /// Check a parsed version against every clause
    pub fn matches(&self, version: &Version) -> bool {
        self.clauses.iter().all(|c| c.matches(version))
    }

    /// Check a textual version; unparsable versions never match
    pub fn matches_str(&self, version: &str) -> bool {
        parse_version(version).is_some_and(|v| self.matches(&v))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check whether `version` satisfies `constraint`
///
/// Total: returns `false` for any malformed input instead of failing.
pub fn is_compatible(constraint: &str, version: &str) -> bool {
    match VersionConstraint::parse(constraint) {
        Ok(c) => c.matches_str(version),
        Err(e) => {
            tracing::debug!("{}", e);
            false
        }
    }
}

/// Compare two plain versions; `None` if either fails to parse
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_version(a)?.cmp(&parse_version(b)?))
}

/// Whether `candidate` is strictly newer than `current`
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Some(Ordering::Greater)
}
