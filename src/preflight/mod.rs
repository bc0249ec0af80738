//! Preflight checks for build validation.
//!
//! Validates that the host has every external tool the resolved graph will
//! invoke before any lifecycle stage starts. This prevents cryptic failures
//! halfway through a multi-node build.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::graph::propagate::ResolvedOptions;
use crate::graph::DependencyGraph;
use crate::profile::SettingsProfile;

/// Check if a command exists on the host PATH.
pub fn command_exists(tool: &str) -> bool {
    which::which(tool).is_ok()
}

/// Every tool the graph will invoke under this profile, with step
/// predicates already applied (a Windows-only step contributes nothing on
/// a Linux profile).
pub fn tools_for_graph(
    graph: &DependencyGraph,
    profile: &SettingsProfile,
    options: &ResolvedOptions,
) -> BTreeSet<String> {
    let mut tools = BTreeSet::new();
    for name in graph.node_names() {
        let node_options = options.node(name);
        for step in &graph.recipe(name).build.steps {
            let applies = step
                .when
                .as_ref()
                .map(|when| when.matches(profile, node_options))
                .unwrap_or(true);
            if applies {
                tools.insert(step.tool.clone());
            }
        }
    }
    tools
}

/// Check that specific tools are available.
pub fn check_required_tools<'a>(tools: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let missing: Vec<String> = tools
        .into_iter()
        .filter(|tool| !command_exists(tool))
        .map(|tool| tool.to_string())
        .collect();

    if !missing.is_empty() {
        return Err(Error::MissingHostTools { tools: missing });
    }
    Ok(())
}

/// Check that every tool the graph needs is available.
pub fn check_graph_tools(
    graph: &DependencyGraph,
    profile: &SettingsProfile,
    options: &ResolvedOptions,
) -> Result<()> {
    let tools = tools_for_graph(graph, profile, options);
    check_required_tools(tools.iter().map(|t| t.as_str()))
}
