//! Dependency graph resolution and build ordering.
//!
//! The graph is built once per top-level request by walking `requires`
//! references through a recipe search path, and is read-only during
//! execution. Requirements pin exact versions; two requirements for the
//! same name with different versions fail fast rather than being solved.

pub mod propagate;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};
use crate::recipe::{Recipe, RecipeReference};

/// Locates recipe files for requirements.
///
/// Each directory on the search path is probed for
/// `<name>-<version>.toml`, then `<name>.toml`.
#[derive(Debug, Clone)]
pub struct RecipeLoader {
    search_path: Vec<PathBuf>,
}

impl RecipeLoader {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    /// Load and verify the recipe for one requirement.
    pub fn load(&self, reference: &RecipeReference) -> Result<Recipe> {
        for dir in &self.search_path {
            let candidates = [
                dir.join(format!("{}-{}.toml", reference.name, reference.version)),
                dir.join(format!("{}.toml", reference.name)),
            ];
            for path in candidates {
                if !path.is_file() {
                    continue;
                }
                let recipe = Recipe::load(&path)?;
                if recipe.package.name != reference.name
                    || recipe.package.version != reference.version
                {
                    return Err(Error::RequirementMismatch {
                        path,
                        found: format!("{}/{}", recipe.package.name, recipe.package.version),
                        requested: format!("{}/{}", reference.name, reference.version),
                    });
                }
                return Ok(recipe);
            }
        }

        Err(Error::RecipeNotFound {
            reference: reference.to_string(),
            searched: self
                .search_path
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Directed acyclic graph of recipes keyed by package name.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Recipe>,
    /// name -> names it requires
    edges: BTreeMap<String, BTreeSet<String>>,
    /// name -> names requiring it
    reverse: BTreeMap<String, BTreeSet<String>>,
    root: String,
}

impl DependencyGraph {
    /// Resolve the full graph reachable from `root`.
    pub fn resolve(root: Recipe, loader: &RecipeLoader) -> Result<Self> {
        let root_name = root.package.name.clone();
        let mut nodes: BTreeMap<String, Recipe> = BTreeMap::new();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut pinned: BTreeMap<String, semver::Version> = BTreeMap::new();

        pinned.insert(root_name.clone(), root.package.version.clone());
        let mut queue: VecDeque<Recipe> = VecDeque::from([root]);

        while let Some(recipe) = queue.pop_front() {
            let name = recipe.package.name.clone();
            if nodes.contains_key(&name) {
                continue;
            }
            edges.entry(name.clone()).or_default();
            reverse.entry(name.clone()).or_default();

            for requirement in &recipe.package.requires {
                match pinned.get(&requirement.name) {
                    Some(existing) if *existing != requirement.version => {
                        return Err(Error::RequirementConflict {
                            name: requirement.name.clone(),
                            first: existing.to_string(),
                            second: requirement.version.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        pinned.insert(requirement.name.clone(), requirement.version.clone());
                        queue.push_back(loader.load(requirement)?);
                    }
                }

                edges
                    .entry(name.clone())
                    .or_default()
                    .insert(requirement.name.clone());
                reverse
                    .entry(requirement.name.clone())
                    .or_default()
                    .insert(name.clone());
            }

            debug!(package = %name, "resolved into dependency graph");
            nodes.insert(name, recipe);
        }

        let graph = Self {
            nodes,
            edges,
            reverse,
            root: root_name,
        };
        // Surface cycles at resolution time, not mid-run.
        graph.build_order()?;
        Ok(graph)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn recipe(&self, name: &str) -> &Recipe {
        &self.nodes[name]
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, name: &str) -> &BTreeSet<String> {
        &self.edges[name]
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, name: &str) -> &BTreeSet<String> {
        &self.reverse[name]
    }

    /// Kahn's algorithm. Returns names in build order, dependencies before
    /// dependents; deterministic for a given graph.
    pub fn build_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), self.edges[name].len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for dependent in &self.reverse[name] {
                let deg = in_degree.get_mut(dependent.as_str()).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let remaining: Vec<&str> = self
                .nodes
                .keys()
                .map(|s| s.as_str())
                .filter(|name| !order.iter().any(|o| o == name))
                .collect();
            return Err(Error::DependencyCycle(remaining.join(" -> ")));
        }

        Ok(order)
    }

    /// Topological waves: every node in wave N depends only on nodes in
    /// earlier waves, so nodes within one wave may build concurrently.
    pub fn waves(&self) -> Result<Vec<Vec<String>>> {
        let order = self.build_order()?;
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        for name in &order {
            let d = self.edges[name]
                .iter()
                .map(|dep| depth[dep.as_str()] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name, d);
            if waves.len() <= d {
                waves.resize_with(d + 1, Vec::new);
            }
            waves[d].push(name.clone());
        }

        Ok(waves)
    }
}
