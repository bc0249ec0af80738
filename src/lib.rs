//! Deterministic recipe lifecycle runner.
//!
//! recipe-forge loads declarative TOML recipes describing how to obtain,
//! patch, build, package, and export one versioned third-party library,
//! resolves their dependency requirements into a graph with transitive
//! option propagation, and runs the `source → build → package → export`
//! lifecycle per node, caching artifact sets by a settings-derived identity.
//!
//! - **Recipe model** - TOML declarations: requirements, settings
//!   sensitivity, option domains, propagation, patches, build steps,
//!   copy rules, exported link requirements
//! - **Graph resolution** - requirement loading, topological ordering,
//!   option propagation with fail-fast conflict detection
//! - **Lifecycle** - strictly linear per-node state machine driving
//!   external build tools with captured output
//! - **Package store** - content-addressed cache keyed by package identity
//!
//! # Architecture
//!
//! ```text
//! recipe.toml ──> Recipe ──> DependencyGraph ──> ResolvedOptions (barrier)
//!                                  │
//!                                  ▼
//!                             GraphRunner ── topological waves, worker pool
//!                                  │
//!                      ┌───────────┴───────────┐
//!                      ▼                       ▼
//!               LifecycleRunner          PackageStore
//!               source → build →         (restore on identity hit,
//!               package → export          store after export)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use recipe_forge::{
//!     DependencyGraph, GraphRunner, Recipe, RecipeLoader, RunnerConfig,
//!     SettingsProfile,
//! };
//! use std::path::Path;
//!
//! let recipe = Recipe::load(Path::new("recipes/protobuf.toml"))?;
//! let loader = RecipeLoader::new(vec!["recipes".into()]);
//! let graph = DependencyGraph::resolve(recipe, &loader)?;
//!
//! let profile = SettingsProfile::host_default();
//! let runner = GraphRunner::new(RunnerConfig::new(".forge", profile))?;
//! let report = runner.run(&graph)?;
//! ```

pub mod error;
pub mod fetch;
pub mod fsutil;
pub mod graph;
pub mod lifecycle;
pub mod patch;
pub mod preflight;
pub mod profile;
pub mod recipe;
pub mod runner;
pub mod store;

pub use error::{Error, Result};
pub use fetch::ChecksumPolicy;
pub use graph::propagate::{resolve_options, ResolvedOptions};
pub use graph::{DependencyGraph, RecipeLoader};
pub use lifecycle::{
    CancelToken, LifecycleConfig, LifecycleRunner, LifecycleState, PackageDescriptor,
};
pub use profile::{package_identity, PlatformPolicy, SettingsProfile};
pub use recipe::{Recipe, RecipeReference};
pub use runner::{GraphRunner, NodeOutcome, RunReport, RunnerConfig};
pub use store::PackageStore;
