//! Plugin manifest parsing and validation
//!
//! Manifests are JSON documents. Every top-level key is first classified
//! into a typed [`ManifestField`], then folded into a fixed
//! [`PluginManifest`]. Validation is eager and exhaustive: one call reports
//! every offending field, not only the first. Unknown keys are preserved in
//! [`PluginManifest::extra`] but never interpreted.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::{FieldError, PluginError};
use crate::types::{DependencySpec, Permission, PluginRecord};

/// Fixed set of plugin categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Behavior,
    Appearance,
    Interaction,
    Productivity,
    Utility,
    Entertainment,
    Social,
    System,
}

impl PluginCategory {
    pub const ALL: [PluginCategory; 8] = [
        PluginCategory::Behavior,
        PluginCategory::Appearance,
        PluginCategory::Interaction,
        PluginCategory::Productivity,
        PluginCategory::Utility,
        PluginCategory::Entertainment,
        PluginCategory::Social,
        PluginCategory::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::Behavior => "behavior",
            PluginCategory::Appearance => "appearance",
            PluginCategory::Interaction => "interaction",
            PluginCategory::Productivity => "productivity",
            PluginCategory::Utility => "utility",
            PluginCategory::Entertainment => "entertainment",
            PluginCategory::Social => "social",
            PluginCategory::System => "system",
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = PluginCategory::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown category '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

/// Runtime configuration block of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub hot_reload: bool,
    pub auto_update: bool,
    /// Memory ceiling in megabytes
    pub max_memory: Option<u64>,
    /// Network timeout in seconds
    pub network_timeout: Option<u64>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            hot_reload: false,
            auto_update: true,
            max_memory: None,
            network_timeout: None,
        }
    }
}

/// A classified top-level manifest entry
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestField {
    Id(String),
    Name(String),
    Version(String),
    Description(String),
    Author(String),
    Category(PluginCategory),
    Main(String),
    Homepage(String),
    License(String),
    Keywords(Vec<String>),
    Platforms(Vec<String>),
    Permissions(BTreeSet<Permission>),
    Dependencies(Vec<DependencySpec>),
    Config(PluginConfig),
    Extra(String, Value),
}

impl ManifestField {
    /// Classify and validate a single key/value pair
    ///
    /// Returns every problem found inside the value (e.g. several bad
    /// permission names), not only the first.
    pub fn classify(key: &str, value: &Value) -> Result<ManifestField, Vec<FieldError>> {
        match key {
            "id" => {
                let id = expect_string(key, value)?;
                if !is_valid_id(&id) {
                    return Err(vec![FieldError::new(key, "must match [a-z0-9_]+")]);
                }
                Ok(ManifestField::Id(id))
            }
            "name" => expect_non_empty(key, value).map(ManifestField::Name),
            "version" => {
                let version = expect_string(key, value)?;
                if !is_plain_version(&version) {
                    return Err(vec![FieldError::new(key, "must be MAJOR.MINOR.PATCH")]);
                }
                Ok(ManifestField::Version(version))
            }
            "description" => expect_string(key, value).map(ManifestField::Description),
            "author" => expect_non_empty(key, value).map(ManifestField::Author),
            "category" => {
                let raw = expect_string(key, value)?;
                raw.parse::<PluginCategory>()
                    .map(ManifestField::Category)
                    .map_err(|e| vec![FieldError::new(key, e)])
            }
            "main" => expect_non_empty(key, value).map(ManifestField::Main),
            "homepage" => expect_string(key, value).map(ManifestField::Homepage),
            "license" => expect_string(key, value).map(ManifestField::License),
            "keywords" => expect_string_list(key, value).map(ManifestField::Keywords),
            "platforms" => expect_string_list(key, value).map(ManifestField::Platforms),
            "permissions" => parse_permissions(value).map(ManifestField::Permissions),
            "dependencies" => parse_dependencies(value).map(ManifestField::Dependencies),
            "config" => parse_config(value).map(ManifestField::Config),
            other => Ok(ManifestField::Extra(other.to_string(), value.clone())),
        }
    }
}

/// Validated plugin manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub category: PluginCategory,
    pub main: String,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub keywords: Vec<String>,
    pub platforms: Vec<String>,
    pub permissions: BTreeSet<Permission>,
    pub dependencies: Vec<DependencySpec>,
    pub config: PluginConfig,
    /// Unknown keys, preserved verbatim
    pub extra: BTreeMap<String, Value>,
}

const REQUIRED_FIELDS: [&str; 7] = [
    "id",
    "name",
    "version",
    "description",
    "author",
    "category",
    "main",
];

impl PluginManifest {
    /// Parse a manifest from raw bytes (UTF-8 JSON)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PluginError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PluginError::invalid_field("manifest", format!("not UTF-8: {}", e)))?;
        Self::from_json(text)
    }

    /// Parse and validate a manifest from JSON text
    pub fn from_json(json: &str) -> Result<Self, PluginError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| PluginError::invalid_field("manifest", format!("invalid JSON: {}", e)))?;

        let map = match value {
            Value::Object(map) => map,
            _ => {
                return Err(PluginError::invalid_field(
                    "manifest",
                    "top level must be an object",
                ))
            }
        };

        Self::from_map(&map)
    }

    fn from_map(map: &Map<String, Value>) -> Result<Self, PluginError> {
        let mut errors = Vec::new();

        for field in REQUIRED_FIELDS {
            if !map.contains_key(field) {
                errors.push(FieldError::new(field, "is required"));
            }
        }

        let mut id = None;
        let mut name = None;
        let mut version = None;
        let mut description = None;
        let mut author = None;
        let mut category = None;
        let mut main = None;
        let mut manifest_homepage = None;
        let mut manifest_license = None;
        let mut keywords = Vec::new();
        let mut platforms = Vec::new();
        let mut permissions = BTreeSet::new();
        let mut dependencies = Vec::new();
        let mut config = PluginConfig::default();
        let mut extra = BTreeMap::new();

        for (key, value) in map {
            match ManifestField::classify(key, value) {
                Ok(ManifestField::Id(v)) => id = Some(v),
                Ok(ManifestField::Name(v)) => name = Some(v),
                Ok(ManifestField::Version(v)) => version = Some(v),
                Ok(ManifestField::Description(v)) => description = Some(v),
                Ok(ManifestField::Author(v)) => author = Some(v),
                Ok(ManifestField::Category(v)) => category = Some(v),
                Ok(ManifestField::Main(v)) => main = Some(v),
                Ok(ManifestField::Homepage(v)) => manifest_homepage = Some(v),
                Ok(ManifestField::License(v)) => manifest_license = Some(v),
                Ok(ManifestField::Keywords(v)) => keywords = v,
                Ok(ManifestField::Platforms(v)) => platforms = v,
                Ok(ManifestField::Permissions(v)) => permissions = v,
                Ok(ManifestField::Dependencies(v)) => dependencies = v,
                Ok(ManifestField::Config(v)) => config = v,
                Ok(ManifestField::Extra(k, v)) => {
                    extra.insert(k, v);
                }
                Err(mut field_errors) => errors.append(&mut field_errors),
            }
        }

        if let Some(own_id) = &id {
            if dependencies.iter().any(|d: &DependencySpec| &d.plugin_id == own_id) {
                errors.push(FieldError::new("dependencies", "plugin cannot depend on itself"));
            }
        }

        match (id, name, version, description, author, category, main) {
            (
                Some(id),
                Some(name),
                Some(version),
                Some(description),
                Some(author),
                Some(category),
                Some(main),
            ) if errors.is_empty() => Ok(PluginManifest {
                id,
                name,
                version,
                description,
                author,
                category,
                main,
                homepage: manifest_homepage,
                license: manifest_license,
                keywords,
                platforms,
                permissions,
                dependencies,
                config,
                extra,
            }),
            _ => Err(PluginError::ValidationFailed(errors)),
        }
    }

    /// Build a not-yet-installed record for this manifest
    pub fn to_record(&self, size: u64) -> PluginRecord {
        let mut record = PluginRecord::new(&self.id, &self.name, &self.version);
        record.size = size;
        record.permissions = self.permissions.clone();
        record.dependencies = self.dependencies.clone();
        record
    }
}

/// `[a-z0-9_]+`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// `MAJOR.MINOR.PATCH`, each segment a `u64` without leading zeros
pub fn is_plain_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| is_version_segment(p))
}

fn is_version_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.chars().all(|c| c.is_ascii_digit())
        && (segment == "0" || !segment.starts_with('0'))
        && segment.parse::<u64>().is_ok()
}

fn expect_string(key: &str, value: &Value) -> Result<String, Vec<FieldError>> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| vec![FieldError::new(key, "must be a string")])
}

fn expect_non_empty(key: &str, value: &Value) -> Result<String, Vec<FieldError>> {
    let s = expect_string(key, value)?;
    if s.trim().is_empty() {
        return Err(vec![FieldError::new(key, "must not be empty")]);
    }
    Ok(s)
}

fn expect_string_list(key: &str, value: &Value) -> Result<Vec<String>, Vec<FieldError>> {
    let items = value
        .as_array()
        .ok_or_else(|| vec![FieldError::new(key, "must be an array of strings")])?;

    let mut out = Vec::with_capacity(items.len());
    let mut errors = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(s) => out.push(s.to_string()),
            None => errors.push(FieldError::new(format!("{}[{}]", key, i), "must be a string")),
        }
    }
    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

fn parse_permissions(value: &Value) -> Result<BTreeSet<Permission>, Vec<FieldError>> {
    let names = expect_string_list("permissions", value)?;
    let mut permissions = BTreeSet::new();
    let mut errors = Vec::new();
    for (i, name) in names.iter().enumerate() {
        match name.parse::<Permission>() {
            Ok(p) => {
                permissions.insert(p);
            }
            Err(e) => errors.push(FieldError::new(format!("permissions[{}]", i), e)),
        }
    }
    if errors.is_empty() {
        Ok(permissions)
    } else {
        Err(errors)
    }
}

fn parse_dependencies(value: &Value) -> Result<Vec<DependencySpec>, Vec<FieldError>> {
    let items = value
        .as_array()
        .ok_or_else(|| vec![FieldError::new("dependencies", "must be an array")])?;

    let mut deps = Vec::with_capacity(items.len());
    let mut errors = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let field = format!("dependencies[{}]", i);
        let Some(obj) = item.as_object() else {
            errors.push(FieldError::new(field, "must be an object"));
            continue;
        };

        let id = obj.get("id").and_then(Value::as_str);
        let constraint = obj.get("version").and_then(Value::as_str);
        let required = match obj.get("required") {
            None => Some(true),
            Some(v) => v.as_bool(),
        };

        match id {
            Some(id) if is_valid_id(id) => {}
            Some(_) => errors.push(FieldError::new(format!("{}.id", field), "must match [a-z0-9_]+")),
            None => errors.push(FieldError::new(format!("{}.id", field), "is required")),
        }
        if constraint.map_or(true, |c| c.trim().is_empty()) {
            errors.push(FieldError::new(format!("{}.version", field), "is required"));
        }
        if required.is_none() {
            errors.push(FieldError::new(format!("{}.required", field), "must be a boolean"));
        }

        if let (Some(id), Some(constraint), Some(required)) = (id, constraint, required) {
            deps.push(DependencySpec {
                plugin_id: id.to_string(),
                version_constraint: constraint.trim().to_string(),
                is_required: required,
            });
        }
    }

    if errors.is_empty() {
        Ok(deps)
    } else {
        Err(errors)
    }
}

fn parse_config(value: &Value) -> Result<PluginConfig, Vec<FieldError>> {
    let obj = value
        .as_object()
        .ok_or_else(|| vec![FieldError::new("config", "must be an object")])?;

    let mut config = PluginConfig::default();
    let mut errors = Vec::new();

    for (key, v) in obj {
        let field = format!("config.{}", key);
        match key.as_str() {
            "hotReload" => match v.as_bool() {
                Some(b) => config.hot_reload = b,
                None => errors.push(FieldError::new(field, "must be a boolean")),
            },
            "autoUpdate" => match v.as_bool() {
                Some(b) => config.auto_update = b,
                None => errors.push(FieldError::new(field, "must be a boolean")),
            },
            "maxMemory" => match v.as_u64() {
                Some(n) => config.max_memory = Some(n),
                None => errors.push(FieldError::new(field, "must be a non-negative integer")),
            },
            "networkTimeout" => match v.as_u64() {
                Some(n) => config.network_timeout = Some(n),
                None => errors.push(FieldError::new(field, "must be a non-negative integer")),
            },
            // Unknown config keys are tolerated
            _ => {}
        }
    }

    if errors.is_empty() {
        Ok(config)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "id": "weather_widget",
        "name": "Weather Widget",
        "version": "1.2.0",
        "description": "Shows the weather",
        "author": "Jo",
        "category": "utility",
        "main": "lib/main.wasm",
        "permissions": ["network", "notifications"],
        "dependencies": [
            {"id": "core_ui", "version": "^1.0.0"},
            {"id": "maps", "version": ">=2.0.0", "required": false}
        ],
        "config": {"hotReload": true, "maxMemory": 64},
        "x-build": {"sha": "abc"}
    }"#;

    #[test]
    fn test_parse_valid_manifest() {
        let manifest = PluginManifest::from_json(VALID).unwrap();
        assert_eq!(manifest.id, "weather_widget");
        assert_eq!(manifest.category, PluginCategory::Utility);
        assert_eq!(manifest.permissions.len(), 2);
        assert_eq!(manifest.dependencies.len(), 2);
        assert!(manifest.dependencies[0].is_required);
        assert!(!manifest.dependencies[1].is_required);
        assert!(manifest.config.hot_reload);
        assert!(manifest.config.auto_update);
        assert_eq!(manifest.config.max_memory, Some(64));
        assert!(manifest.extra.contains_key("x-build"));
    }

    #[test]
    fn test_reports_every_offending_field() {
        let json = r#"{
            "id": "Bad-Id",
            "name": "x",
            "version": "1.0",
            "description": "d",
            "author": "a",
            "category": "spaceship",
            "main": "m",
            "permissions": ["network", "telepathy", "mindControl"]
        }"#;

        let err = PluginManifest::from_json(json).unwrap_err();
        let PluginError::ValidationFailed(errors) = err else {
            panic!("expected ValidationFailed");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"id"));
        assert!(fields.contains(&"version"));
        assert!(fields.contains(&"category"));
        assert!(fields.contains(&"permissions[1]"));
        assert!(fields.contains(&"permissions[2]"));
    }

    #[test]
    fn test_missing_required_fields() {
        let err = PluginManifest::from_json(r#"{"id": "a"}"#).unwrap_err();
        let PluginError::ValidationFailed(errors) = err else {
            panic!("expected ValidationFailed");
        };
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let json = r#"{
            "id": "loop", "name": "L", "version": "1.0.0", "description": "",
            "author": "a", "category": "system", "main": "m",
            "dependencies": [{"id": "loop", "version": "1.0.0"}]
        }"#;
        assert!(PluginManifest::from_json(json).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(PluginManifest::from_json("[1, 2]").is_err());
        assert!(PluginManifest::from_json("not json").is_err());
        assert!(PluginManifest::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_to_record() {
        let manifest = PluginManifest::from_json(VALID).unwrap();
        let record = manifest.to_record(4096);
        assert_eq!(record.id, "weather_widget");
        assert_eq!(record.size, 4096);
        assert_eq!(record.dependencies.len(), 2);
    }

    #[test]
    fn test_version_semver_cannot_order_is_rejected() {
        for version in ["01.2.0", "1.2.99999999999999999999"] {
            let text = VALID.replace("\"1.2.0\"", &format!("\"{}\"", version));
            match PluginManifest::from_json(&text) {
                Err(PluginError::ValidationFailed(errors)) => {
                    assert!(errors.iter().any(|e| e.field == "version"), "{:?}", errors);
                }
                other => panic!("accepted {}: {:?}", version, other),
            }
        }
    }

    #[test]
    fn test_id_and_version_helpers() {
        assert!(is_valid_id("abc_123"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("ABC"));
        assert!(is_plain_version("10.0.3"));
        assert!(!is_plain_version("1.0.0-beta"));
        assert!(!is_plain_version("1..0"));
        assert!(is_plain_version("0.0.0"));
        assert!(!is_plain_version("01.0.0"));
        assert!(!is_plain_version("1.00.0"));
        assert!(!is_plain_version("1.0.18446744073709551616"));
        assert!(is_plain_version("1.0.18446744073709551615"));
    }
}
