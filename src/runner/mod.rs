//! Graph-wide build orchestration.
//!
//! Option propagation runs to completion as a barrier, then lifecycles
//! execute in topological waves: nodes within a wave have no dependency
//! edges between them and run concurrently on a bounded worker pool, each
//! in its own private working directory.
//!
//! Failure policy is fail-fast by default: the first node failure cancels
//! in-flight work (killing external tools) and surfaces that error.
//! `keep_going` instead records the failure, continues independent
//! subtrees, and skips every node downstream of a failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use rayon::prelude::*;
use tracing::info;

use crate::error::{Error, Result};
use crate::graph::propagate::{resolve_options, ResolvedOptions};
use crate::graph::DependencyGraph;
use crate::lifecycle::{CancelToken, LifecycleConfig, LifecycleRunner};
use crate::profile::SettingsProfile;
use crate::store::PackageStore;

/// Configuration for one graph run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root under which `work/` (per-node directories) and `store/` live.
    pub work_root: PathBuf,
    pub profile: SettingsProfile,
    /// User-requested option values applied to the root recipe.
    pub root_options: BTreeMap<String, String>,
    pub lifecycle: LifecycleConfig,
    /// Worker pool size for independent nodes.
    pub workers: usize,
    /// Continue independent subtrees past a failure.
    pub keep_going: bool,
    /// Bypass the package store and rebuild everything.
    pub rebuild: bool,
}

impl RunnerConfig {
    pub fn new(work_root: impl Into<PathBuf>, profile: SettingsProfile) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            work_root: work_root.into(),
            profile,
            root_options: BTreeMap::new(),
            lifecycle: LifecycleConfig::default(),
            workers,
            keep_going: false,
            rebuild: false,
        }
    }
}

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Restored from the package store without running the lifecycle.
    Restored,
    /// Full lifecycle ran and the result was stored.
    Built,
    /// Lifecycle failed (keep-going mode only; fail-fast surfaces the
    /// error instead).
    Failed(String),
    /// Not attempted because a dependency failed or was skipped.
    Skipped { unavailable_dependency: String },
}

/// Per-node outcomes of a completed (or best-effort completed) run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: BTreeMap<String, NodeOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, NodeOutcome::Restored | NodeOutcome::Built))
    }

    /// Nodes that failed, with their error text.
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                NodeOutcome::Failed(err) => Some((name.as_str(), err.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// Runs a resolved dependency graph to completion.
pub struct GraphRunner {
    config: RunnerConfig,
    store: PackageStore,
}

impl GraphRunner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let store = PackageStore::open(config.work_root.join("store"))?;
        Ok(Self { config, store })
    }

    /// Resolve options (barrier), then execute every node.
    ///
    /// Fail-fast runs return the first node error; keep-going runs return a
    /// report whose entries may include failures and skips.
    pub fn run(&self, graph: &DependencyGraph) -> Result<RunReport> {
        // The propagation pre-pass must fully complete before any node's
        // lifecycle starts.
        let options = resolve_options(graph, &self.config.root_options)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| Error::Other(e.to_string()))?;
        let cancel = CancelToken::new();

        let mut report = RunReport::default();
        let mut package_dirs: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut unavailable: BTreeSet<String> = BTreeSet::new();

        for wave in graph.waves()? {
            let mut runnable: Vec<String> = Vec::new();
            for name in wave {
                match graph
                    .dependencies(&name)
                    .iter()
                    .find(|dep| unavailable.contains(*dep))
                {
                    Some(dep) => {
                        unavailable.insert(name.clone());
                        report.outcomes.insert(
                            name,
                            NodeOutcome::Skipped {
                                unavailable_dependency: dep.clone(),
                            },
                        );
                    }
                    None => runnable.push(name),
                }
            }

            let keep_going = self.config.keep_going;
            let results: Vec<(String, Result<(NodeOutcome, PathBuf)>)> = pool.install(|| {
                runnable
                    .par_iter()
                    .map(|name| {
                        let result =
                            self.run_node(graph, name, &options, &package_dirs, &cancel);
                        if result.is_err() && !keep_going {
                            // Stop in-flight siblings at their next check.
                            cancel.cancel();
                        }
                        (name.clone(), result)
                    })
                    .collect()
            });

            let mut first_error: Option<Error> = None;
            for (name, result) in results {
                match result {
                    Ok((outcome, package_dir)) => {
                        package_dirs.insert(name.clone(), package_dir);
                        report.outcomes.insert(name, outcome);
                    }
                    Err(err) => {
                        unavailable.insert(name.clone());
                        if keep_going {
                            report
                                .outcomes
                                .insert(name, NodeOutcome::Failed(err.to_string()));
                        } else {
                            // Prefer the root cause over knock-on cancellations.
                            match first_error {
                                None => first_error = Some(err),
                                Some(Error::Cancelled) if !matches!(err, Error::Cancelled) => {
                                    first_error = Some(err)
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        Ok(report)
    }

    fn run_node(
        &self,
        graph: &DependencyGraph,
        name: &str,
        options: &ResolvedOptions,
        package_dirs: &BTreeMap<String, PathBuf>,
        cancel: &CancelToken,
    ) -> Result<(NodeOutcome, PathBuf)> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let recipe = graph.recipe(name);
        let deps: BTreeMap<String, PathBuf> = graph
            .dependencies(name)
            .iter()
            .map(|dep| (dep.clone(), package_dirs[dep].clone()))
            .collect();

        let mut lifecycle = LifecycleRunner::new(
            recipe,
            &self.config.profile,
            options.node(name).clone(),
            deps,
            &self.config.work_root.join("work"),
            &self.config.lifecycle,
            cancel.clone(),
        );
        let identity = lifecycle.identity().to_string();
        let package_dir = lifecycle.paths().package.clone();

        if !self.config.rebuild {
            if let Some(entry) = self.store.get(&identity)? {
                self.store.restore(&entry, &package_dir)?;
                info!(node = %name, identity = %identity, "restored from package store");
                return Ok((NodeOutcome::Restored, package_dir));
            }
        }

        lifecycle.run_all()?;
        self.store.put(
            &identity,
            &recipe.package.name,
            &recipe.package.version.to_string(),
            &package_dir,
        )?;
        Ok((NodeOutcome::Built, package_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::sha256_file;
    use crate::graph::RecipeLoader;
    use crate::lifecycle::DESCRIPTOR_FILENAME;
    use crate::profile::{Arch, BuildType, Compiler, Os};
    use crate::recipe::Recipe;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn profile() -> SettingsProfile {
        SettingsProfile {
            os: Os::Linux,
            arch: Arch::X86_64,
            compiler: Compiler::Gcc,
            compiler_runtime: None,
            build_type: BuildType::Release,
        }
    }

    /// Write an upstream source file and return (url, sha256).
    fn upstream(temp: &TempDir, name: &str, content: &str) -> (String, String) {
        let path = temp.path().join(name);
        fs::write(&path, content).unwrap();
        let (digest, _) = sha256_file(&path).unwrap();
        let url = url::Url::from_file_path(&path).unwrap().to_string();
        (url, digest)
    }

    /// A recipe whose build step is a small shell script producing install
    /// outputs, so the whole lifecycle runs against real tools.
    fn buildable_recipe(
        name: &str,
        url: &str,
        sha256: &str,
        requires: &[&str],
        extra: &str,
    ) -> String {
        let requires_line = if requires.is_empty() {
            String::new()
        } else {
            format!(
                "requires = [{}]",
                requires
                    .iter()
                    .map(|r| format!("\"{r}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        format!(
            r#"
            [package]
            name = "{name}"
            version = "1.0.0"
            settings = ["os", "build_type"]
            {requires_line}

            [options.shared]
            values = ["true", "false"]
            default = "false"

            [source]
            url = "{url}"
            sha256 = "{sha256}"

            [[source.patch]]
            file = "{name}.h"
            find = "UPSTREAM"
            replace = "PATCHED"

            [[build.step]]
            tool = "sh"
            args = ["-c", "mkdir -p install/include install/lib && cp '%(source_dir)s/{name}.h' install/include/ && printf archive > 'install/lib/lib{name}.a'"]

            [[package_rules.copy]]
            pattern = "*.h"
            from = "install/include"
            to = "include"
            required = true

            [[package_rules.copy]]
            pattern = "*.a"
            from = "install/lib"
            to = "lib"
            keep_paths = false
            required = true

            [[export.lib]]
            name = "{name}"

            {extra}
            "#
        )
    }

    fn write_recipe_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("{name}.toml"));
        fs::write(&path, body).unwrap();
        path
    }

    fn resolve_graph(recipes_dir: &Path, root: &str) -> DependencyGraph {
        let loader = RecipeLoader::new(vec![recipes_dir.to_path_buf()]);
        let recipe = Recipe::load(&recipes_dir.join(format!("{root}.toml"))).unwrap();
        DependencyGraph::resolve(recipe, &loader).unwrap()
    }

    fn config_in(temp: &TempDir, subdir: &str) -> RunnerConfig {
        let mut config = RunnerConfig::new(temp.path().join(subdir), profile());
        config.lifecycle.download_cache = temp.path().join(subdir).join("downloads");
        config.workers = 2;
        config
    }

    fn setup_chain(temp: &TempDir) -> PathBuf {
        let recipes = temp.path().join("recipes");
        fs::create_dir_all(&recipes).unwrap();

        let (zlib_url, zlib_sha) = upstream(temp, "zlib.h", "int UPSTREAM_Z = 1;");
        // Patch pattern matches the literal UPSTREAM token in the header.
        let (app_url, app_sha) = upstream(temp, "app.h", "int UPSTREAM_A = 1;");

        write_recipe_file(
            &recipes,
            "zlib",
            &buildable_recipe("zlib", &zlib_url, &zlib_sha, &[], ""),
        );
        write_recipe_file(
            &recipes,
            "app",
            &buildable_recipe(
                "app",
                &app_url,
                &app_sha,
                &["zlib/1.0.0"],
                r#"
                [[propagate]]
                dependency = "zlib"
                option = "shared"
                from = "shared"
                "#,
            ),
        );
        recipes
    }

    #[test]
    fn full_graph_builds_packages_and_exports() {
        let temp = TempDir::new().unwrap();
        let recipes = setup_chain(&temp);
        let graph = resolve_graph(&recipes, "app");

        let runner = GraphRunner::new(config_in(&temp, "forge")).unwrap();
        let report = runner.run(&graph).unwrap();

        assert!(report.succeeded());
        assert_eq!(report.outcomes["zlib"], NodeOutcome::Built);
        assert_eq!(report.outcomes["app"], NodeOutcome::Built);

        // Packaged layout and patched header made it through.
        let work = temp.path().join("forge/work");
        let zlib_pkg = fs::read_dir(&work)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("zlib-"))
            })
            .expect("zlib node dir")
            .join("package");
        assert!(zlib_pkg.join("lib/libzlib.a").is_file());
        assert!(zlib_pkg.join(DESCRIPTOR_FILENAME).is_file());
        assert_eq!(
            fs::read_to_string(zlib_pkg.join("include/zlib.h")).unwrap(),
            "int PATCHED_Z = 1;"
        );
    }

    #[test]
    fn second_run_restores_from_store() {
        let temp = TempDir::new().unwrap();
        let recipes = setup_chain(&temp);
        let graph = resolve_graph(&recipes, "app");
        let runner = GraphRunner::new(config_in(&temp, "forge")).unwrap();

        let first = runner.run(&graph).unwrap();
        assert_eq!(first.outcomes["app"], NodeOutcome::Built);

        let second = runner.run(&graph).unwrap();
        assert_eq!(second.outcomes["zlib"], NodeOutcome::Restored);
        assert_eq!(second.outcomes["app"], NodeOutcome::Restored);
    }

    #[test]
    fn rebuild_bypasses_the_store() {
        let temp = TempDir::new().unwrap();
        let recipes = setup_chain(&temp);
        let graph = resolve_graph(&recipes, "app");

        let mut config = config_in(&temp, "forge");
        let runner = GraphRunner::new(config.clone()).unwrap();
        runner.run(&graph).unwrap();

        config.rebuild = true;
        let runner = GraphRunner::new(config).unwrap();
        let report = runner.run(&graph).unwrap();
        assert_eq!(report.outcomes["zlib"], NodeOutcome::Built);
    }

    #[test]
    fn exported_descriptors_are_byte_identical_across_clean_runs() {
        let temp = TempDir::new().unwrap();
        let recipes = setup_chain(&temp);
        let graph = resolve_graph(&recipes, "app");

        let descriptor_bytes = |subdir: &str| {
            let runner = GraphRunner::new(config_in(&temp, subdir)).unwrap();
            runner.run(&graph).unwrap();
            let work = temp.path().join(subdir).join("work");
            let node = fs::read_dir(&work)
                .unwrap()
                .map(|e| e.unwrap().path())
                .find(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("app-"))
                })
                .expect("app node dir");
            fs::read(node.join("package").join(DESCRIPTOR_FILENAME)).unwrap()
        };

        let first = descriptor_bytes("run-a");
        let second = descriptor_bytes("run-b");
        assert_eq!(first, second);
    }

    #[test]
    fn fail_fast_surfaces_the_stage_error() {
        let temp = TempDir::new().unwrap();
        let recipes = temp.path().join("recipes");
        fs::create_dir_all(&recipes).unwrap();
        let (url, sha) = upstream(&temp, "broken.h", "int UPSTREAM_B = 1;");

        let mut body = buildable_recipe("broken", &url, &sha, &[], "");
        body = body.replace("printf archive >", "exit 9 ; printf archive >");
        write_recipe_file(&recipes, "broken", &body);

        let graph = resolve_graph(&recipes, "broken");
        let runner = GraphRunner::new(config_in(&temp, "forge")).unwrap();
        let err = runner.run(&graph).unwrap_err();

        match err {
            Error::Stage { node, stage, source } => {
                assert_eq!(node, "broken/1.0.0");
                assert_eq!(stage, "build");
                assert!(matches!(
                    *source,
                    Error::BuildToolInvocation { code: 9, .. }
                ));
            }
            other => panic!("expected Stage error, got {other}"),
        }
    }

    #[test]
    fn keep_going_skips_downstream_and_builds_independent_nodes() {
        let temp = TempDir::new().unwrap();
        let recipes = temp.path().join("recipes");
        fs::create_dir_all(&recipes).unwrap();

        let (good_url, good_sha) = upstream(&temp, "good.h", "int UPSTREAM_G = 1;");
        let (bad_url, bad_sha) = upstream(&temp, "bad.h", "int UPSTREAM_X = 1;");
        let (app_url, app_sha) = upstream(&temp, "app.h", "int UPSTREAM_A = 1;");

        write_recipe_file(
            &recipes,
            "good",
            &buildable_recipe("good", &good_url, &good_sha, &[], ""),
        );
        let mut bad = buildable_recipe("bad", &bad_url, &bad_sha, &[], "");
        bad = bad.replace("printf archive >", "exit 3 ; printf archive >");
        write_recipe_file(&recipes, "bad", &bad);
        write_recipe_file(
            &recipes,
            "app",
            &buildable_recipe("app", &app_url, &app_sha, &["good/1.0.0", "bad/1.0.0"], ""),
        );

        let graph = resolve_graph(&recipes, "app");
        let mut config = config_in(&temp, "forge");
        config.keep_going = true;
        let runner = GraphRunner::new(config).unwrap();
        let report = runner.run(&graph).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.outcomes["good"], NodeOutcome::Built);
        assert!(matches!(report.outcomes["bad"], NodeOutcome::Failed(_)));
        assert_eq!(
            report.outcomes["app"],
            NodeOutcome::Skipped {
                unavailable_dependency: "bad".to_string()
            }
        );
        assert_eq!(report.failures().len(), 1);
    }

    #[test]
    fn option_conflict_aborts_before_any_build_starts() {
        let temp = TempDir::new().unwrap();
        let recipes = temp.path().join("recipes");
        fs::create_dir_all(&recipes).unwrap();

        let (d_url, d_sha) = upstream(&temp, "libd.h", "int UPSTREAM_D = 1;");
        let (a_url, a_sha) = upstream(&temp, "liba.h", "int UPSTREAM_A = 1;");
        let (b_url, b_sha) = upstream(&temp, "libb.h", "int UPSTREAM_B = 1;");
        let (app_url, app_sha) = upstream(&temp, "app.h", "int UPSTREAM_R = 1;");

        write_recipe_file(
            &recipes,
            "libd",
            &buildable_recipe("libd", &d_url, &d_sha, &[], ""),
        );
        write_recipe_file(
            &recipes,
            "liba",
            &buildable_recipe(
                "liba",
                &a_url,
                &a_sha,
                &["libd/1.0.0"],
                "[[propagate]]\ndependency = \"libd\"\noption = \"shared\"\nvalue = \"true\"\n",
            ),
        );
        write_recipe_file(
            &recipes,
            "libb",
            &buildable_recipe(
                "libb",
                &b_url,
                &b_sha,
                &["libd/1.0.0"],
                "[[propagate]]\ndependency = \"libd\"\noption = \"shared\"\nvalue = \"false\"\n",
            ),
        );
        write_recipe_file(
            &recipes,
            "app",
            &buildable_recipe("app", &app_url, &app_sha, &["liba/1.0.0", "libb/1.0.0"], ""),
        );

        let graph = resolve_graph(&recipes, "app");
        let work_root = temp.path().join("forge");
        let runner = GraphRunner::new(config_in(&temp, "forge")).unwrap();
        let err = runner.run(&graph).unwrap_err();

        assert!(matches!(err, Error::OptionConflict { .. }));
        // The barrier held: no node directory was even created.
        assert!(!work_root.join("work").exists());
    }

    #[test]
    fn root_option_override_changes_resolved_options() {
        let temp = TempDir::new().unwrap();
        let recipes = setup_chain(&temp);
        let graph = resolve_graph(&recipes, "app");

        let mut config = config_in(&temp, "forge");
        config
            .root_options
            .insert("shared".to_string(), "true".to_string());
        let runner = GraphRunner::new(config).unwrap();
        runner.run(&graph).unwrap();

        // Propagation forwarded the override into zlib, whose descriptor
        // now reports a shared artifact.
        let work = temp.path().join("forge/work");
        let zlib_pkg = fs::read_dir(&work)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("zlib-"))
            })
            .expect("zlib node dir")
            .join("package");
        let descriptor =
            crate::lifecycle::PackageDescriptor::read(&zlib_pkg).unwrap();
        assert_eq!(descriptor.options["shared"], "true");
        assert_eq!(descriptor.libs, vec!["libzlib.so".to_string()]);
    }
}
