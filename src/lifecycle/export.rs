//! The `export` stage: emit the machine-readable package descriptor.
//!
//! The descriptor tells a consuming resolution step which artifact this is
//! (identity + settings + options) and how to link against it (library file
//! names per build type and platform policy, preprocessor defines, category
//! directories). Output is byte-identical across runs for identical inputs:
//! sorted maps, declared ordering for link-sensitive lists, no timestamps.

use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lifecycle::NodePaths;
use crate::profile::{BuildType, PlatformPolicy, SettingKey, SettingsProfile};
use crate::recipe::{LibKind, Recipe};

/// Canonical descriptor file name inside a package.
pub const DESCRIPTOR_FILENAME: &str = "forge-info.json";
/// Shell-style metadata emitted by the `env` generator.
pub const ENV_FILENAME: &str = "forge-env.sh";

/// Exported link requirements for one packaged artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    /// Settings-derived package identity (sha256 hex).
    pub identity: String,
    pub settings: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
    /// Library file names in declared (link) order.
    pub libs: Vec<String>,
    pub defines: Vec<String>,
    pub include_dir: String,
    pub lib_dir: String,
    pub bin_dir: String,
}

impl PackageDescriptor {
    /// Read a descriptor back from a package directory.
    pub fn read(package_dir: &std::path::Path) -> Result<Self> {
        let path = package_dir.join(DESCRIPTOR_FILENAME);
        let bytes = fs::read(&path).map_err(|e| Error::path_io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Parse {
            path,
            reason: e.to_string(),
        })
    }
}

pub(crate) fn run(
    recipe: &Recipe,
    profile: &SettingsProfile,
    options: &BTreeMap<String, String>,
    identity: &str,
    policy: PlatformPolicy,
    paths: &NodePaths,
) -> Result<PackageDescriptor> {
    // Conventional `shared` option steers LibKind::Auto naming.
    let shared_build = options.get("shared").map(|v| v == "true").unwrap_or(false);
    let debug_build = profile.build_type == BuildType::Debug;

    let mut libs = Vec::new();
    for decl in &recipe.export.libs {
        if let Some(when) = &decl.when {
            if !when.matches(profile, options) {
                continue;
            }
        }
        let mut base = decl.name.clone();
        if debug_build {
            if let Some(suffix) = &decl.debug_suffix {
                base.push_str(suffix);
            }
        }
        let shared = match decl.kind {
            LibKind::Auto => shared_build,
            LibKind::Static => false,
            LibKind::Shared => true,
        };
        libs.push(policy.lib_filename(&base, shared));
    }

    let mut defines = Vec::new();
    for decl in &recipe.export.defines {
        if let Some(when) = &decl.when {
            if !when.matches(profile, options) {
                continue;
            }
        }
        defines.push(decl.name.clone());
    }

    let mut settings = BTreeMap::new();
    for key in [
        SettingKey::Os,
        SettingKey::Arch,
        SettingKey::Compiler,
        SettingKey::CompilerRuntime,
        SettingKey::BuildType,
    ] {
        if let Some(value) = profile.value_of(key) {
            settings.insert(key.as_str().to_string(), value);
        }
    }

    let descriptor = PackageDescriptor {
        name: recipe.package.name.clone(),
        version: recipe.package.version.to_string(),
        identity: identity.to_string(),
        settings,
        options: options.clone(),
        libs,
        defines,
        include_dir: "include".to_string(),
        lib_dir: "lib".to_string(),
        bin_dir: "bin".to_string(),
    };

    let json_path = paths.package.join(DESCRIPTOR_FILENAME);
    let mut body = serde_json::to_string_pretty(&descriptor).map_err(|e| Error::Parse {
        path: json_path.clone(),
        reason: e.to_string(),
    })?;
    body.push('\n');
    fs::write(&json_path, body).map_err(|e| Error::path_io(&json_path, e))?;

    for generator in &recipe.export.generators {
        match generator.as_str() {
            // The descriptor itself; always written above.
            "json" => {}
            "env" => write_env_file(&descriptor, paths)?,
            // Unknown names are rejected at recipe load.
            other => {
                return Err(Error::Other(format!("unhandled generator '{}'", other)));
            }
        }
    }

    debug!(path = %json_path.display(), "exported package descriptor");
    Ok(descriptor)
}

/// Emit `forge-env.sh`: the same link requirements as shell variables, for
/// consumption by script-driven builds.
fn write_env_file(descriptor: &PackageDescriptor, paths: &NodePaths) -> Result<()> {
    let prefix = shell_var_name(&descriptor.name);
    let mut body = String::new();
    body.push_str(&format!(
        "export FORGE_{}_VERSION=\"{}\"\n",
        prefix, descriptor.version
    ));
    body.push_str(&format!(
        "export FORGE_{}_INCLUDE_DIR=\"{}\"\n",
        prefix, descriptor.include_dir
    ));
    body.push_str(&format!(
        "export FORGE_{}_LIB_DIR=\"{}\"\n",
        prefix, descriptor.lib_dir
    ));
    body.push_str(&format!(
        "export FORGE_{}_LIBS=\"{}\"\n",
        prefix,
        descriptor.libs.join(" ")
    ));
    body.push_str(&format!(
        "export FORGE_{}_DEFINES=\"{}\"\n",
        prefix,
        descriptor.defines.join(" ")
    ));

    let path = paths.package.join(ENV_FILENAME);
    fs::write(&path, body).map_err(|e| Error::path_io(&path, e))
}

fn shell_var_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
