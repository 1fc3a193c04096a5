//! Dependency Resolver
//!
//! Orders plugins so every required dependency loads before its dependent,
//! checks declared constraints against loaded versions, and resolves one
//! version per external dependency name.
//!
//! Optional edges never constrain the order. Unregistered dependency names
//! are ignored for ordering; they are reported by [`DependencyResolver::check`].

use semver::Version;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::version::{DependencySpec, Operator, parse_version};
use crate::{PluginError, PluginResult};

#[derive(Debug, Clone)]
struct Node {
    version: Version,
    dependencies: Vec<DependencySpec>,
}

/// Derived edge, used only for resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub requirement: String,
    pub optional: bool,
}

/// Result of ordering a batch that may contain cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Every plugin neither on nor downstream of a cycle, dependencies first
    pub order: Vec<String>,
    /// Each detected cycle, first node repeated at the end
    pub cycles: Vec<Vec<String>>,
    /// Plugins that require a cycle member, directly or transitively,
    /// with the index into `cycles` of the cycle they reach
    pub downstream: BTreeMap<String, usize>,
}

impl LoadPlan {
    /// Plugins on any cycle or depending on one
    pub fn blocked(&self) -> BTreeSet<String> {
        self.cycles
            .iter()
            .flatten()
            .chain(self.downstream.keys())
            .cloned()
            .collect()
    }
}

/// A declared dependency whose loaded version violates its constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyConflict {
    pub dependency: String,
    pub required: String,
    pub found: String,
    pub optional: bool,
}

/// Outcome of checking one plugin's dependencies against what is loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub plugin: String,
    pub satisfied: Vec<String>,
    pub missing_required: Vec<String>,
    pub missing_optional: Vec<String>,
    pub conflicts: Vec<DependencyConflict>,
}

impl DependencyReport {
    /// Required dependencies are all present at acceptable versions
    pub fn is_satisfied(&self) -> bool {
        self.missing_required.is_empty() && self.conflicts.iter().all(|c| c.optional)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

#[derive(Debug, Default)]
pub struct DependencyResolver {
    nodes: BTreeMap<String, Node>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a plugin and its declared dependencies
    pub fn register(&mut self, name: &str, version: Version, dependencies: Vec<DependencySpec>) {
        debug!(plugin = %name, version = %version, dependencies = dependencies.len(), "Registering plugin dependencies");
        self.nodes.insert(
            name.to_string(),
            Node {
                version,
                dependencies,
            },
        );
    }

    /// Drop a plugin from the graph; returns whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> &[DependencySpec] {
        self.nodes
            .get(name)
            .map_or(&[][..], |n| n.dependencies.as_slice())
    }

    /// Every edge in the graph
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.nodes
            .iter()
            .flat_map(|(from, node)| {
                node.dependencies.iter().map(move |dep| DependencyEdge {
                    from: from.clone(),
                    to: dep.name.clone(),
                    requirement: dep.requirement(),
                    optional: dep.optional,
                })
            })
            .collect()
    }

    /// Registered plugins that directly require `name`
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| {
                node.dependencies
                    .iter()
                    .any(|d| !d.optional && d.name == name)
            })
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Total order over `names` (and their registered required dependencies).
    ///
    /// Fails with [`PluginError::CircularDependency`] on the first cycle found.
    pub fn load_order(&self, names: &[String]) -> PluginResult<Vec<String>> {
        let mut walk = Walk::new(self, true);
        for name in sorted(names) {
            walk.visit(&name)?;
        }
        Ok(walk.order)
    }

    /// Like [`load_order`](Self::load_order), but cycles are collected instead of
    /// failing. Cycle members and every plugin whose required dependencies
    /// reach one are left out of the order.
    pub fn plan_load(&self, names: &[String]) -> LoadPlan {
        let mut walk = Walk::new(self, false);
        for name in sorted(names) {
            // Non-failing walk never returns Err.
            let _ = walk.visit(&name);
        }

        let mut cycle_of: HashMap<&str, usize> = HashMap::new();
        for (index, cycle) in walk.cycles.iter().enumerate() {
            for member in cycle {
                cycle_of.entry(member.as_str()).or_insert(index);
            }
        }

        // Dependencies precede dependents in the walk order, so one pass
        // carries the block downstream.
        let mut downstream: BTreeMap<String, usize> = BTreeMap::new();
        let mut order = Vec::new();
        for name in &walk.order {
            if cycle_of.contains_key(name.as_str()) {
                continue;
            }
            let reached = self
                .dependencies_of(name)
                .iter()
                .filter(|d| !d.optional)
                .find_map(|d| {
                    cycle_of
                        .get(d.name.as_str())
                        .or_else(|| downstream.get(&d.name))
                        .copied()
                });
            match reached {
                Some(index) => {
                    warn!(plugin = %name, cycle = %walk.cycles[index].join(" -> "), "Blocked by a dependency cycle");
                    downstream.insert(name.clone(), index);
                }
                None => order.push(name.clone()),
            }
        }

        LoadPlan {
            order,
            cycles: walk.cycles,
            downstream,
        }
    }

    /// Check `plugin`'s declared dependencies against the loaded versions
    pub fn check(&self, plugin: &str, loaded: &HashMap<String, Version>) -> DependencyReport {
        let mut report = DependencyReport {
            plugin: plugin.to_string(),
            ..Default::default()
        };

        for dep in self.dependencies_of(plugin) {
            match loaded.get(&dep.name) {
                None if dep.optional => report.missing_optional.push(dep.name.clone()),
                None => report.missing_required.push(dep.name.clone()),
                Some(found) if dep.matches(found) => report.satisfied.push(dep.name.clone()),
                Some(found) => {
                    if dep.optional {
                        warn!(plugin = %plugin, dependency = %dep.name, required = %dep.requirement(), found = %found, "Optional dependency version mismatch");
                    }
                    report.conflicts.push(DependencyConflict {
                        dependency: dep.name.clone(),
                        required: dep.requirement(),
                        found: found.to_string(),
                        optional: dep.optional,
                    });
                }
            }
        }

        report
    }

    /// [`check`](Self::check) against the versions registered in this graph
    pub fn check_registered(&self, plugin: &str) -> DependencyReport {
        let registered: HashMap<String, Version> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.version.clone()))
            .collect();
        self.check(plugin, &registered)
    }

    /// Pick one version per dependency name that satisfies every request.
    ///
    /// Candidates come from `catalogue` when it lists the name, otherwise from
    /// the versions pinned in the constraints themselves. The highest candidate
    /// meeting all constraints wins. Names with no constraints and no
    /// catalogue entry have nothing to resolve and are omitted.
    pub fn resolve_versions(
        requests: &[DependencySpec],
        catalogue: &HashMap<String, Vec<Version>>,
    ) -> PluginResult<BTreeMap<String, Version>> {
        let mut grouped: BTreeMap<&str, Vec<&DependencySpec>> = BTreeMap::new();
        for spec in requests {
            grouped.entry(spec.name.as_str()).or_default().push(spec);
        }

        let mut resolved = BTreeMap::new();
        for (name, specs) in grouped {
            let candidates: Vec<Version> = match catalogue.get(name) {
                Some(available) => available.clone(),
                None => specs
                    .iter()
                    .flat_map(|s| s.constraints.iter())
                    .filter(|c| matches!(c.op, Operator::Eq | Operator::Compatible))
                    .filter_map(|c| c.pinned().cloned())
                    .collect(),
            };

            // Only bounds and no catalogue: nothing to pick from, which is not a conflict
            if candidates.is_empty() && !catalogue.contains_key(name) {
                debug!(dependency = %name, "No candidate versions without a catalogue, leaving unresolved");
                continue;
            }

            let best = candidates
                .into_iter()
                .filter(|v| specs.iter().all(|s| s.matches(v)))
                .max_by(|a, b| a.cmp_precedence(b));

            match best {
                Some(version) => {
                    debug!(dependency = %name, version = %version, "Resolved dependency version");
                    resolved.insert(name.to_string(), version);
                }
                None => {
                    let constraints = specs
                        .iter()
                        .map(|s| s.requirement())
                        .collect::<Vec<_>>()
                        .join(" and ");
                    return Err(PluginError::VersionConflict {
                        dependency: name.to_string(),
                        constraints,
                    });
                }
            }
        }

        Ok(resolved)
    }

    /// Convenience over [`resolve_versions`](Self::resolve_versions) for
    /// catalogues written as strings
    pub fn parse_catalogue(
        entries: &[(&str, &[&str])],
    ) -> PluginResult<HashMap<String, Vec<Version>>> {
        entries
            .iter()
            .map(|(name, versions)| {
                let parsed = versions
                    .iter()
                    .map(|v| parse_version(v))
                    .collect::<PluginResult<Vec<_>>>()?;
                Ok((name.to_string(), parsed))
            })
            .collect()
    }
}

fn sorted(names: &[String]) -> Vec<String> {
    let mut names = names.to_vec();
    names.sort();
    names.dedup();
    names
}

/// Three-colour depth-first walk
struct Walk<'a> {
    resolver: &'a DependencyResolver,
    fail_fast: bool,
    marks: HashMap<String, Mark>,
    stack: Vec<String>,
    order: Vec<String>,
    cycles: Vec<Vec<String>>,
}

impl<'a> Walk<'a> {
    fn new(resolver: &'a DependencyResolver, fail_fast: bool) -> Self {
        Self {
            resolver,
            fail_fast,
            marks: HashMap::new(),
            stack: Vec::new(),
            order: Vec::new(),
            cycles: Vec::new(),
        }
    }

    fn visit(&mut self, name: &str) -> PluginResult<()> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle: Vec<String> = self.stack[start..].to_vec();
                cycle.push(name.to_string());
                warn!(cycle = %cycle.join(" -> "), "Circular dependency detected");
                if self.fail_fast {
                    return Err(PluginError::CircularDependency { cycle });
                }
                self.cycles.push(cycle);
                return Ok(());
            }
            None => {}
        }

        self.marks.insert(name.to_string(), Mark::InProgress);
        self.stack.push(name.to_string());

        let required: Vec<String> = self
            .resolver
            .dependencies_of(name)
            .iter()
            .filter(|d| !d.optional && self.resolver.contains(&d.name))
            .map(|d| d.name.clone())
            .collect();
        for dep in required {
            self.visit(&dep)?;
        }

        self.stack.pop();
        self.marks.insert(name.to_string(), Mark::Done);
        self.order.push(name.to_string());
        Ok(())
    }
}
