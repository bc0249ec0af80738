//! The `package` stage: collect build outputs into the canonical layout.
//!
//! Copy rules are (glob pattern, source subdirectory, destination category)
//! triples filtered by an optional settings predicate. The package directory
//! is recreated from scratch each run, so stale output from a prior partial
//! run never leaks through.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::fsutil::recreate_dir;
use crate::lifecycle::NodePaths;
use crate::patch::apply_patches;
use crate::profile::SettingsProfile;
use crate::recipe::{substitute, CopyRule, Recipe};

pub(crate) fn run(
    recipe: &Recipe,
    profile: &SettingsProfile,
    options: &BTreeMap<String, String>,
    vars: &BTreeMap<String, String>,
    paths: &NodePaths,
) -> Result<()> {
    recreate_dir(&paths.package)?;

    // Post-install fixups against the build tree (rewriting baked-in paths
    // in generated build-system descriptors) happen before collection.
    apply_patches(&paths.build, &recipe.package_rules.patches)?;

    for rule in &recipe.package_rules.copy {
        if let Some(when) = &rule.when {
            if !when.matches(profile, options) {
                debug!(pattern = %rule.pattern, "skipping copy rule, predicate not met");
                continue;
            }
        }
        apply_rule(rule, vars, paths)?;
    }

    Ok(())
}

fn apply_rule(rule: &CopyRule, vars: &BTreeMap<String, String>, paths: &NodePaths) -> Result<()> {
    let rendered_from = substitute(&rule.from, vars);
    let base = if Path::new(&rendered_from).is_absolute() {
        PathBuf::from(&rendered_from)
    } else {
        paths.build.join(&rendered_from)
    };

    let pattern = Pattern::new(&rule.pattern).map_err(|e| Error::Parse {
        path: PathBuf::from(&rule.pattern),
        reason: e.to_string(),
    })?;

    let dest_root = if rule.to == "." {
        paths.package.clone()
    } else {
        paths.package.join(&rule.to)
    };

    let mut copied = 0usize;
    if base.is_dir() {
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&base)
                .map_err(|e| Error::Other(e.to_string()))?;
            let file_name = entry.file_name().to_string_lossy();

            if !pattern.matches_path(rel) && !pattern.matches(&file_name) {
                continue;
            }

            let dest = if rule.keep_paths {
                dest_root.join(rel)
            } else {
                dest_root.join(file_name.as_ref())
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| Error::path_io(&dest, e))?;
            copied += 1;
        }
    }

    if copied == 0 && rule.required {
        return Err(Error::MissingArtifact {
            pattern: rule.pattern.clone(),
            from: rendered_from,
            to: rule.to.clone(),
        });
    }

    debug!(
        pattern = %rule.pattern,
        from = %base.display(),
        to = %rule.to,
        copied,
        "applied copy rule"
    );
    Ok(())
}
