//! Dependency resolution
//!
//! Builds the dependency graph of a target plugin over the installed and
//! available plugin sets, then reports everything that blocks installation:
//!
//! - **missing**: a required dependency found in neither set
//! - **conflict**: a dependency whose version does not satisfy the request;
//!   every other installed dependent of that dependency is listed with its
//!   own constraint so the host can see who pins it
//! - **circular**: cycles, found with a three-color depth-first search
//!
//! When none of these occur, Kahn's algorithm yields the install order
//! (dependencies first, ties broken by ascending plugin id).
//!
//! Resolution never stops at the first problem; one result enumerates all of
//! them.

use sdk::errors::{DependencyFailure, PluginError};
use sdk::types::PluginRecord;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

use crate::version;

/// A required dependency that could not be found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    pub dependency_id: String,
    pub required_by: String,
    pub constraint: String,
}

/// A dependency whose version does not satisfy a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyConflict {
    pub dependency_id: String,
    pub required_by: String,
    pub constraint: String,
    pub found_version: String,
    /// Other installed dependents of the same dependency: `(plugin_id, constraint)`
    pub other_dependents: Vec<(String, String)>,
}

/// Outcome of a single resolution call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyResolutionResult {
    pub success: bool,
    pub install_order: Vec<String>,
    pub missing_dependencies: Vec<MissingDependency>,
    pub conflicting_dependencies: Vec<DependencyConflict>,
    /// Each entry lists the members of one cycle, smallest id first
    pub circular_dependencies: Vec<Vec<String>>,
    /// Non-fatal notes, e.g. absent optional dependencies
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl DependencyResolutionResult {
    pub fn missing_ids(&self) -> Vec<&str> {
        self.missing_dependencies
            .iter()
            .map(|m| m.dependency_id.as_str())
            .collect()
    }

    /// Convert a failed result into the matching error kind
    pub fn to_error(&self) -> Option<PluginError> {
        if self.success {
            return None;
        }
        let kind = if !self.circular_dependencies.is_empty() {
            DependencyFailure::Circular
        } else if !self.missing_dependencies.is_empty() {
            DependencyFailure::Missing
        } else if !self.conflicting_dependencies.is_empty() {
            DependencyFailure::Conflict
        } else {
            return Some(PluginError::Internal(
                self.error
                    .clone()
                    .unwrap_or_else(|| "resolution produced no install order".to_string()),
            ));
        };
        Some(PluginError::DependencyUnsatisfied {
            kind,
            detail: self.error.clone().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Dependency resolver
///
/// Stateless; every call builds a fresh graph from the maps it is given.
#[derive(Debug, Default)]
pub struct DependencyResolver {}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {}
    }

    /// Resolve `target` against the installed and available sets
    ///
    /// Lookups prefer `installed`, then `available`. References to the
    /// target's own id always resolve to `target` itself, so re-validating
    /// an installed plugin sees its current record.
    pub fn resolve(
        &self,
        target: &PluginRecord,
        installed: &HashMap<String, PluginRecord>,
        available: &HashMap<String, PluginRecord>,
    ) -> DependencyResolutionResult {
        debug!("Resolving dependencies for {}@{}", target.id, target.version);

        let mut result = DependencyResolutionResult::default();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        edges.insert(target.id.clone(), BTreeSet::new());

        let mut queue: VecDeque<&PluginRecord> = VecDeque::new();
        queue.push_back(target);

        while let Some(record) = queue.pop_front() {
            for dep in &record.dependencies {
                let Some(found) = lookup(&dep.plugin_id, target, installed, available) else {
                    if dep.is_required {
                        let missing = MissingDependency {
                            dependency_id: dep.plugin_id.clone(),
                            required_by: record.id.clone(),
                            constraint: dep.version_constraint.clone(),
                        };
                        if !result.missing_dependencies.contains(&missing) {
                            result.missing_dependencies.push(missing);
                        }
                    } else {
                        result.warnings.push(format!(
                            "optional dependency {} of {} is not available",
                            dep.plugin_id, record.id
                        ));
                    }
                    continue;
                };

                let compatible = version::is_compatible(&dep.version_constraint, &found.version);

                if !dep.is_required {
                    if !compatible {
                        result.warnings.push(format!(
                            "optional dependency {} {} of {} does not match {}",
                            dep.plugin_id, found.version, record.id, dep.version_constraint
                        ));
                    }
                    continue;
                }

                if !compatible {
                    let other_dependents = find_dependents(&dep.plugin_id, installed)
                        .into_iter()
                        .filter(|(id, _)| id != &record.id)
                        .collect();
                    result.conflicting_dependencies.push(DependencyConflict {
                        dependency_id: dep.plugin_id.clone(),
                        required_by: record.id.clone(),
                        constraint: dep.version_constraint.clone(),
                        found_version: found.version.clone(),
                        other_dependents,
                    });
                }

                edges
                    .entry(record.id.clone())
                    .or_default()
                    .insert(found.id.clone());
                if !edges.contains_key(&found.id) {
                    edges.insert(found.id.clone(), BTreeSet::new());
                    queue.push_back(found);
                }
            }
        }

        result.circular_dependencies = find_cycles(&edges);

        let blocked = !result.circular_dependencies.is_empty()
            || !result.missing_dependencies.is_empty()
            || !result.conflicting_dependencies.is_empty();

        if !blocked {
            match topological_order(&edges) {
                Some(order) => result.install_order = order,
                None => {
                    // The DFS reported no cycle, so Kahn must drain every node
                    tracing::error!(
                        "Topological sort for {} left nodes unprocessed without a detected cycle",
                        target.id
                    );
                    result.error = Some("internal error: inconsistent dependency graph".to_string());
                }
            }
        }

        result.success = !result.install_order.is_empty() && !blocked;

        if !result.success && result.error.is_none() {
            result.error = Some(describe_failure(&result));
        }

        if result.success {
            debug!("Install order for {}: {:?}", target.id, result.install_order);
        } else {
            warn!(
                "Dependency resolution failed for {}: {}",
                target.id,
                result.error.as_deref().unwrap_or("unknown")
            );
        }

        result
    }
}

fn lookup<'a>(
    id: &str,
    target: &'a PluginRecord,
    installed: &'a HashMap<String, PluginRecord>,
    available: &'a HashMap<String, PluginRecord>,
) -> Option<&'a PluginRecord> {
    if id == target.id {
        Some(target)
    } else {
        installed.get(id).or_else(|| available.get(id))
    }
}

/// Installed plugins that require `dependency_id`, sorted by plugin id
pub fn find_dependents(
    dependency_id: &str,
    installed: &HashMap<String, PluginRecord>,
) -> Vec<(String, String)> {
    let mut dependents: Vec<(String, String)> = installed
        .values()
        .flat_map(|record| {
            record
                .required_dependencies()
                .filter(|d| d.plugin_id == dependency_id)
                .map(|d| (record.id.clone(), d.version_constraint.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    dependents.sort();
    dependents
}

/// Installed dependents whose constraint `new_version` of `plugin_id` would break
pub fn check_reverse_constraints(
    plugin_id: &str,
    new_version: &str,
    installed: &HashMap<String, PluginRecord>,
) -> Vec<DependencyConflict> {
    let dependents = find_dependents(plugin_id, installed);
    dependents
        .iter()
        .filter(|(_, constraint)| !version::is_compatible(constraint, new_version))
        .map(|(dependent, constraint)| DependencyConflict {
            dependency_id: plugin_id.to_string(),
            required_by: dependent.clone(),
            constraint: constraint.clone(),
            found_version: new_version.to_string(),
            other_dependents: dependents
                .iter()
                .filter(|(id, _)| id != dependent)
                .cloned()
                .collect(),
        })
        .collect()
}

/// Three-color DFS; every back-edge to a gray node yields one cycle
fn find_cycles(edges: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, BTreeSet<String>>,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        cycles: &mut BTreeSet<Vec<String>>,
    ) {
        colors.insert(node, Color::Gray);
        path.push(node);

        if let Some(neighbors) = edges.get(node) {
            for next in neighbors {
                match colors.get(next.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => visit(next, edges, colors, path, cycles),
                    Color::Gray => {
                        if let Some(start) = path.iter().position(|n| *n == next.as_str()) {
                            cycles.insert(normalize_cycle(&path[start..]));
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
    }

    let mut colors: HashMap<&str, Color> = HashMap::new();
    let mut cycles = BTreeSet::new();
    let mut path = Vec::new();

    for node in edges.keys() {
        if colors.get(node.as_str()).copied().unwrap_or(Color::White) == Color::White {
            visit(node, edges, &mut colors, &mut path, &mut cycles);
        }
    }

    cycles.into_iter().collect()
}

/// Rotate so the smallest id comes first
fn normalize_cycle(members: &[&str]) -> Vec<String> {
    let start = members
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    members[start..]
        .iter()
        .chain(members[..start].iter())
        .map(|s| s.to_string())
        .collect()
}

/// Kahn's algorithm; `None` if some node never reaches in-degree zero
fn topological_order(edges: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    // In-degree counts unresolved dependencies of each node
    let mut remaining: BTreeMap<&str, usize> = edges
        .iter()
        .map(|(node, deps)| (node.as_str(), deps.len()))
        .collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (node, deps) in edges {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();

    let mut order = Vec::with_capacity(edges.len());
    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        if let Some(users) = dependents.get(node) {
            for user in users {
                if let Some(count) = remaining.get_mut(user) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*user);
                    }
                }
            }
        }
    }

    if order.len() == edges.len() {
        Some(order)
    } else {
        None
    }
}

fn describe_failure(result: &DependencyResolutionResult) -> String {
    if let Some(cycle) = result.circular_dependencies.first() {
        let mut path = cycle.clone();
        if let Some(first) = cycle.first() {
            path.push(first.clone());
        }
        return format!("Circular dependency detected: {}", path.join(" -> "));
    }

    if !result.missing_dependencies.is_empty() {
        let names: Vec<String> = result
            .missing_dependencies
            .iter()
            .map(|m| format!("{} {} (required by {})", m.dependency_id, m.constraint, m.required_by))
            .collect();
        return format!("Missing dependencies: {}", names.join(", "));
    }

    if let Some(conflict) = result.conflicting_dependencies.first() {
        let mut message = format!(
            "Version conflict: {} requires {} {} but {} is present",
            conflict.required_by, conflict.dependency_id, conflict.constraint, conflict.found_version
        );
        if !conflict.other_dependents.is_empty() {
            let others: Vec<String> = conflict
                .other_dependents
                .iter()
                .map(|(id, c)| format!("{} {}", id, c))
                .collect();
            message.push_str(&format!(" (also required by: {})", others.join(", ")));
        }
        return message;
    }

    "Dependency resolution produced no install order".to_string()
}
