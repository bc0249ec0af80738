//! Single-node lifecycle execution.
//!
//! One [`LifecycleRunner`] drives the strictly linear
//! `Unloaded → Sourced → Built → Packaged → Exported` state machine for a
//! (recipe, profile) pair. A stage failure aborts the run and leaves the
//! state at the last completed stage; there are no retries and no mid-stage
//! resume. Re-running from scratch is safe: stages overwrite their outputs
//! rather than appending, and an already-unpacked source tree is reused.

pub mod build;
pub mod export;
pub mod package;
pub mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::fetch::{ChecksumPolicy, Fetcher};
use crate::profile::{package_identity, node_key, PlatformPolicy, SettingKey, SettingsProfile};
use crate::recipe::Recipe;

pub use export::{PackageDescriptor, DESCRIPTOR_FILENAME};

/// Lifecycle progress for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Unloaded,
    Sourced,
    Built,
    Packaged,
    Exported,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Sourced => "sourced",
            LifecycleState::Built => "built",
            LifecycleState::Packaged => "packaged",
            LifecycleState::Exported => "exported",
        }
    }
}

/// Shared cancellation flag. Checked between stages and while waiting on
/// external tools; a cancelled build kills the child process instead of
/// leaving it dangling.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Private working directories for one node. Distinct nodes never share
/// paths, so no locking is needed during stage execution.
#[derive(Debug, Clone)]
pub struct NodePaths {
    pub root: PathBuf,
    pub source: PathBuf,
    pub build: PathBuf,
    pub package: PathBuf,
}

impl NodePaths {
    pub fn new(work_root: &Path, key: &str) -> Self {
        let root = work_root.join(key);
        Self {
            source: root.join("src"),
            build: root.join("build"),
            package: root.join("package"),
            root,
        }
    }
}

/// Tunables shared by every node of a run.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Shared download cache for source archives.
    pub download_cache: PathBuf,
    pub checksum_policy: ChecksumPolicy,
    /// Parallelism hint handed to build steps via `%(jobs)s`.
    pub jobs: u32,
    /// Wall-clock limit per external build step.
    pub build_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        Self {
            download_cache: default_download_cache(),
            checksum_policy: ChecksumPolicy::default(),
            jobs,
            build_timeout: crate::profile::default_build_timeout(),
        }
    }
}

/// User-level download cache (`~/.cache/recipe-forge/downloads`).
pub fn default_download_cache() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("recipe-forge")
        .join("downloads")
}

/// Executes the lifecycle stages for one (recipe, profile) node.
pub struct LifecycleRunner<'a> {
    recipe: &'a Recipe,
    profile: &'a SettingsProfile,
    options: BTreeMap<String, String>,
    /// Package directories of already-built direct dependencies, exposed to
    /// build steps and copy rules as `%(dep:<name>)s`.
    deps: BTreeMap<String, PathBuf>,
    config: &'a LifecycleConfig,
    cancel: CancelToken,
    paths: NodePaths,
    policy: PlatformPolicy,
    identity: String,
    state: LifecycleState,
}

impl<'a> LifecycleRunner<'a> {
    pub fn new(
        recipe: &'a Recipe,
        profile: &'a SettingsProfile,
        options: BTreeMap<String, String>,
        deps: BTreeMap<String, PathBuf>,
        work_root: &Path,
        config: &'a LifecycleConfig,
        cancel: CancelToken,
    ) -> Self {
        let identity = package_identity(recipe, profile, &options);
        let paths = NodePaths::new(work_root, &node_key(recipe, &identity));
        Self {
            recipe,
            profile,
            options,
            deps,
            config,
            cancel,
            paths,
            policy: profile.policy(),
            identity,
            state: LifecycleState::Unloaded,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.paths.package.join(DESCRIPTOR_FILENAME)
    }

    fn node_id(&self) -> String {
        format!(
            "{}/{}",
            self.recipe.package.name, self.recipe.package.version
        )
    }

    fn expect_state(&self, stage: &'static str, expected: LifecycleState) -> Result<()> {
        if self.state != expected {
            return Err(Error::StageOrder {
                node: self.node_id(),
                stage,
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Variables available to `%(var)s` templates in build args and copy
    /// rule sources.
    fn substitution_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([
            ("name".to_string(), self.recipe.package.name.clone()),
            (
                "version".to_string(),
                self.recipe.package.version.to_string(),
            ),
            (
                "source_dir".to_string(),
                self.paths.source.display().to_string(),
            ),
            (
                "build_dir".to_string(),
                self.paths.build.display().to_string(),
            ),
            (
                "package_dir".to_string(),
                self.paths.package.display().to_string(),
            ),
            (
                "install_prefix".to_string(),
                self.paths.build.join("install").display().to_string(),
            ),
            ("jobs".to_string(), self.config.jobs.to_string()),
        ]);
        for key in [
            SettingKey::Os,
            SettingKey::Arch,
            SettingKey::Compiler,
            SettingKey::CompilerRuntime,
            SettingKey::BuildType,
        ] {
            if let Some(value) = self.profile.value_of(key) {
                vars.insert(key.as_str().to_string(), value);
            }
        }
        for (option, value) in &self.options {
            vars.insert(format!("opt:{}", option), value.clone());
        }
        for (dep, package_dir) in &self.deps {
            vars.insert(format!("dep:{}", dep), package_dir.display().to_string());
        }
        vars
    }

    /// Stage 1: fetch, verify, unpack, patch.
    pub fn source(&mut self) -> Result<()> {
        self.expect_state("source", LifecycleState::Unloaded)?;
        self.cancel.check()?;

        let fetcher = Fetcher::new(&self.config.download_cache, self.config.checksum_policy);
        source::run(self.recipe, &fetcher, &self.paths)
            .map_err(|e| e.in_stage(&self.node_id(), "source"))?;

        self.state = LifecycleState::Sourced;
        Ok(())
    }

    /// Stage 2: run the declared external build steps.
    pub fn build(&mut self) -> Result<()> {
        self.expect_state("build", LifecycleState::Sourced)?;
        self.cancel.check()?;

        let vars = self.substitution_vars();
        build::run(
            self.recipe,
            self.profile,
            &self.options,
            &vars,
            &self.paths,
            self.config.build_timeout,
            &self.cancel,
        )
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => other.in_stage(&self.node_id(), "build"),
        })?;

        self.state = LifecycleState::Built;
        Ok(())
    }

    /// Stage 3: collect build outputs into the package layout.
    pub fn package(&mut self) -> Result<()> {
        self.expect_state("package", LifecycleState::Built)?;
        self.cancel.check()?;

        let vars = self.substitution_vars();
        package::run(self.recipe, self.profile, &self.options, &vars, &self.paths)
            .map_err(|e| e.in_stage(&self.node_id(), "package"))?;

        self.state = LifecycleState::Packaged;
        Ok(())
    }

    /// Stage 4: emit the link-requirement descriptor.
    pub fn export(&mut self) -> Result<PackageDescriptor> {
        self.expect_state("export", LifecycleState::Packaged)?;
        self.cancel.check()?;

        let descriptor = export::run(
            self.recipe,
            self.profile,
            &self.options,
            &self.identity,
            self.policy,
            &self.paths,
        )
        .map_err(|e| e.in_stage(&self.node_id(), "export"))?;

        self.state = LifecycleState::Exported;
        info!(node = %self.node_id(), identity = %self.identity, "lifecycle complete");
        Ok(descriptor)
    }

    /// Run all four stages in order, short-circuiting on the first failure.
    pub fn run_all(&mut self) -> Result<PackageDescriptor> {
        self.source()?;
        self.build()?;
        self.package()?;
        self.export()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::sha256_file;
    use crate::profile::{Arch, BuildType, Compiler, Os};
    use std::fs;
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

    fn recipe_with_step(temp: &TempDir, step_script: &str) -> Recipe {
        let upstream = temp.path().join("demo.h");
        fs::write(&upstream, "int x;").unwrap();
        let (digest, _) = sha256_file(&upstream).unwrap();
        let url = url::Url::from_file_path(&upstream).unwrap();

        let text = format!(
            r#"
            [package]
            name = "demo"
            version = "1.0.0"

            [source]
            url = "{url}"
            sha256 = "{digest}"

            [[build.step]]
            tool = "sh"
            args = ["-c", "{step_script}"]
            "#
        );
        Recipe::from_toml_str(&text, "demo").unwrap()
    }

    fn config_for(temp: &TempDir) -> LifecycleConfig {
        LifecycleConfig {
            download_cache: temp.path().join("downloads"),
            ..LifecycleConfig::default()
        }
    }

    #[test]
    fn run_all_walks_the_states_to_exported() {
        let temp = TempDir::new().unwrap();
        let recipe = recipe_with_step(&temp, "true");
        let config = config_for(&temp);

        let prof = profile();
        let mut runner = LifecycleRunner::new(
            &recipe,
            &prof,
            BTreeMap::new(),
            BTreeMap::new(),
            &temp.path().join("work"),
            &config,
            CancelToken::new(),
        );
        assert_eq!(runner.state(), LifecycleState::Unloaded);

        let descriptor = runner.run_all().unwrap();
        assert_eq!(runner.state(), LifecycleState::Exported);
        assert_eq!(descriptor.name, "demo");
        assert!(runner.descriptor_path().is_file());
    }

    #[test]
    fn build_failure_leaves_state_at_sourced() {
        let temp = TempDir::new().unwrap();
        let recipe = recipe_with_step(&temp, "echo broken; exit 5");
        let config = config_for(&temp);

        let prof = profile();
        let mut runner = LifecycleRunner::new(
            &recipe,
            &prof,
            BTreeMap::new(),
            BTreeMap::new(),
            &temp.path().join("work"),
            &config,
            CancelToken::new(),
        );

        let err = runner.run_all().unwrap_err();
        match &err {
            Error::Stage { node, stage, source } => {
                assert_eq!(node, "demo/1.0.0");
                assert_eq!(*stage, "build");
                assert!(matches!(
                    **source,
                    Error::BuildToolInvocation { code: 5, .. }
                ));
            }
            other => panic!("expected Stage error, got {other}"),
        }
        // Not advanced to the failed stage.
        assert_eq!(runner.state(), LifecycleState::Sourced);
    }

    #[test]
    fn stages_out_of_order_are_rejected() {
        let temp = TempDir::new().unwrap();
        let recipe = recipe_with_step(&temp, "true");
        let config = config_for(&temp);

        let prof = profile();
        let mut runner = LifecycleRunner::new(
            &recipe,
            &prof,
            BTreeMap::new(),
            BTreeMap::new(),
            &temp.path().join("work"),
            &config,
            CancelToken::new(),
        );

        let err = runner.build().unwrap_err();
        assert!(matches!(err, Error::StageOrder { .. }));

        runner.source().unwrap();
        let err = runner.package().unwrap_err();
        assert!(matches!(err, Error::StageOrder { .. }));
    }

    #[test]
    fn cancelled_token_stops_before_the_stage_runs() {
        let temp = TempDir::new().unwrap();
        let recipe = recipe_with_step(&temp, "true");
        let config = config_for(&temp);

        let cancel = CancelToken::new();
        cancel.cancel();
        let prof = profile();
        let mut runner = LifecycleRunner::new(
            &recipe,
            &prof,
            BTreeMap::new(),
            BTreeMap::new(),
            &temp.path().join("work"),
            &config,
            cancel,
        );

        let err = runner.run_all().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(runner.state(), LifecycleState::Unloaded);
    }

    #[test]
    fn identity_differs_per_option_value() {
        let temp = TempDir::new().unwrap();
        let recipe = recipe_with_step(&temp, "true");
        let config = config_for(&temp);

        let work = temp.path().join("work");
        let prof = profile();
        let on = LifecycleRunner::new(
            &recipe,
            &prof,
            BTreeMap::from([("shared".to_string(), "true".to_string())]),
            BTreeMap::new(),
            &work,
            &config,
            CancelToken::new(),
        );
        let off = LifecycleRunner::new(
            &recipe,
            &prof,
            BTreeMap::from([("shared".to_string(), "false".to_string())]),
            BTreeMap::new(),
            &work,
            &config,
            CancelToken::new(),
        );
        assert_ne!(on.identity(), off.identity());
        assert_ne!(on.paths().root, off.paths().root);
    }
}
