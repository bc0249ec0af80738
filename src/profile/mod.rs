//! Settings profiles and platform policy.
//!
//! A profile is a concrete assignment of the platform values that affect
//! binary compatibility (os, arch, compiler, compiler runtime, build type).
//! Recipes declare which of these they are *sensitive* to; the package
//! identity fingerprint only folds in the sensitive subset, so two profiles
//! differing in an ignored setting map to the same binary artifact.
//!
//! Per-OS file layout questions (library file names, executable suffixes)
//! are answered once per profile by [`PlatformPolicy`] instead of scattering
//! `os ==` checks through the packaging code.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::recipe::Recipe;

/// Target operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Macos,
    Windows,
}

/// Target CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
    Aarch64,
}

/// Compiler family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    Gcc,
    Clang,
    #[serde(rename = "apple-clang")]
    AppleClang,
    Msvc,
}

/// How the compiler runtime is linked. Generalizes MSVC's MT/MD split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerRuntime {
    Static,
    Dynamic,
}

/// Build configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    Debug,
    Release,
}

/// The settings a recipe may declare sensitivity to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Os,
    Arch,
    Compiler,
    CompilerRuntime,
    BuildType,
}

impl SettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Os => "os",
            SettingKey::Arch => "arch",
            SettingKey::Compiler => "compiler",
            SettingKey::CompilerRuntime => "compiler_runtime",
            SettingKey::BuildType => "build_type",
        }
    }
}

fn to_toml_word<T: Serialize>(value: &T) -> String {
    // The serde rename attrs are the single source of spelling for
    // settings values; round-trip through the serializer to reuse them.
    toml::Value::try_from(value)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_toml_word(self))
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_toml_word(self))
    }
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_toml_word(self))
    }
}

impl fmt::Display for CompilerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_toml_word(self))
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_toml_word(self))
    }
}

/// A concrete settings assignment, loaded from a TOML profile file or
/// defaulted from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsProfile {
    pub os: Os,
    pub arch: Arch,
    pub compiler: Compiler,
    #[serde(default)]
    pub compiler_runtime: Option<CompilerRuntime>,
    pub build_type: BuildType,
}

impl SettingsProfile {
    /// Load a profile from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
        toml::from_str(&text).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// A release profile for the host platform.
    pub fn host_default() -> Self {
        let os = if cfg!(target_os = "macos") {
            Os::Macos
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            Os::Linux
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "x86") {
            Arch::X86
        } else {
            Arch::X86_64
        };
        let compiler = match os {
            Os::Linux => Compiler::Gcc,
            Os::Macos => Compiler::AppleClang,
            Os::Windows => Compiler::Msvc,
        };
        Self {
            os,
            arch,
            compiler,
            compiler_runtime: None,
            build_type: BuildType::Release,
        }
    }

    /// The textual value of one setting, `None` when unset.
    pub fn value_of(&self, key: SettingKey) -> Option<String> {
        match key {
            SettingKey::Os => Some(self.os.to_string()),
            SettingKey::Arch => Some(self.arch.to_string()),
            SettingKey::Compiler => Some(self.compiler.to_string()),
            SettingKey::CompilerRuntime => self.compiler_runtime.map(|r| r.to_string()),
            SettingKey::BuildType => Some(self.build_type.to_string()),
        }
    }

    /// The file-layout policy for this profile.
    pub fn policy(&self) -> PlatformPolicy {
        PlatformPolicy::for_os(self.os)
    }
}

/// Named per-profile variant answering file-layout questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformPolicy {
    Unix,
    Apple,
    Windows,
}

impl PlatformPolicy {
    pub fn for_os(os: Os) -> Self {
        match os {
            Os::Linux => PlatformPolicy::Unix,
            Os::Macos => PlatformPolicy::Apple,
            Os::Windows => PlatformPolicy::Windows,
        }
    }

    /// File name of a library with the given link base name.
    pub fn lib_filename(&self, base: &str, shared: bool) -> String {
        match (self, shared) {
            (PlatformPolicy::Unix, false) => format!("lib{}.a", base),
            (PlatformPolicy::Unix, true) => format!("lib{}.so", base),
            (PlatformPolicy::Apple, false) => format!("lib{}.a", base),
            (PlatformPolicy::Apple, true) => format!("lib{}.dylib", base),
            // Windows links against the .lib in both cases; the DLL is a
            // runtime artifact placed by copy rules, not a link input.
            (PlatformPolicy::Windows, _) => format!("{}.lib", base),
        }
    }

    /// File name of an executable with the given base name.
    pub fn executable_filename(&self, base: &str) -> String {
        match self {
            PlatformPolicy::Windows => format!("{}.exe", base),
            _ => base.to_string(),
        }
    }
}

/// A predicate over a profile and resolved option values, used to gate
/// copy rules, conditional build arguments, and exported defines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<Compiler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_runtime: Option<CompilerRuntime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_type: Option<BuildType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl SettingsPredicate {
    /// True when every constrained field matches the profile and every
    /// constrained option matches its resolved value.
    pub fn matches(&self, profile: &SettingsProfile, options: &BTreeMap<String, String>) -> bool {
        if self.os.is_some_and(|os| os != profile.os) {
            return false;
        }
        if self.arch.is_some_and(|arch| arch != profile.arch) {
            return false;
        }
        if self.compiler.is_some_and(|c| c != profile.compiler) {
            return false;
        }
        if self
            .compiler_runtime
            .is_some_and(|r| profile.compiler_runtime != Some(r))
        {
            return false;
        }
        if self.build_type.is_some_and(|b| b != profile.build_type) {
            return false;
        }
        self.options
            .iter()
            .all(|(name, want)| options.get(name).is_some_and(|have| have == want))
    }
}

/// Compute the settings-derived package identity for one (recipe, profile,
/// options) combination.
///
/// The fingerprint covers the recipe identity, the settings the recipe is
/// sensitive to, and the resolved option values, rendered canonically
/// (sorted keys) so the digest is stable across runs and declaration order.
pub fn package_identity(
    recipe: &Recipe,
    profile: &SettingsProfile,
    options: &BTreeMap<String, String>,
) -> String {
    let mut canonical = format!("{}/{}\n", recipe.package.name, recipe.package.version);

    let mut keys: Vec<SettingKey> = recipe.package.settings.clone();
    keys.sort();
    keys.dedup();
    for key in keys {
        if let Some(value) = profile.value_of(key) {
            canonical.push_str(&format!("settings.{}={}\n", key.as_str(), value));
        }
    }
    for (name, value) in options {
        canonical.push_str(&format!("options.{}={}\n", name, value));
    }

    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Directory-friendly node key: `name-version-<identity prefix>`.
pub fn node_key(recipe: &Recipe, identity: &str) -> String {
    format!(
        "{}-{}-{}",
        recipe.package.name,
        recipe.package.version,
        &identity[..12.min(identity.len())]
    )
}

/// Default wall-clock limit for one external build step.
pub fn default_build_timeout() -> Duration {
    Duration::from_secs(3600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;

    fn linux_profile() -> SettingsProfile {
        SettingsProfile {
            os: Os::Linux,
            arch: Arch::X86_64,
            compiler: Compiler::Gcc,
            compiler_runtime: None,
            build_type: BuildType::Release,
        }
    }

    fn windows_profile() -> SettingsProfile {
        SettingsProfile {
            os: Os::Windows,
            arch: Arch::X86_64,
            compiler: Compiler::Msvc,
            compiler_runtime: Some(CompilerRuntime::Static),
            build_type: BuildType::Debug,
        }
    }

    fn sample_recipe(settings: &str) -> Recipe {
        let toml = format!(
            r#"
            [package]
            name = "demo"
            version = "1.0.0"
            settings = [{settings}]

            [options.shared]
            values = ["true", "false"]
            default = "false"

            [source]
            url = "file:///dev/null"
            sha256 = "0000000000000000000000000000000000000000000000000000000000000000"
            "#
        );
        Recipe::from_toml_str(&toml, "demo").unwrap()
    }

    #[test]
    fn display_spellings_match_serde() {
        assert_eq!(Os::Linux.to_string(), "linux");
        assert_eq!(Arch::X86_64.to_string(), "x86_64");
        assert_eq!(Compiler::AppleClang.to_string(), "apple-clang");
        assert_eq!(CompilerRuntime::Dynamic.to_string(), "dynamic");
        assert_eq!(BuildType::Release.to_string(), "release");
    }

    #[test]
    fn profile_load_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        std::fs::write(
            &path,
            "os = \"linux\"\narch = \"x86_64\"\ncompiler = \"gcc\"\nbuild_type = \"release\"\nbogus = 1\n",
        )
        .unwrap();
        assert!(SettingsProfile::load(&path).is_err());
    }

    #[test]
    fn predicate_matches_os_and_option() {
        let pred = SettingsPredicate {
            os: Some(Os::Windows),
            options: BTreeMap::from([("shared".to_string(), "true".to_string())]),
            ..Default::default()
        };
        let shared_on = BTreeMap::from([("shared".to_string(), "true".to_string())]);
        let shared_off = BTreeMap::from([("shared".to_string(), "false".to_string())]);

        assert!(pred.matches(&windows_profile(), &shared_on));
        assert!(!pred.matches(&windows_profile(), &shared_off));
        assert!(!pred.matches(&linux_profile(), &shared_on));
    }

    #[test]
    fn identity_ignores_insensitive_settings() {
        let recipe = sample_recipe("\"arch\"");
        let opts = BTreeMap::from([("shared".to_string(), "false".to_string())]);

        // Profiles differ only in os/build_type, which the recipe ignores.
        let a = package_identity(&recipe, &linux_profile(), &opts);
        let b = package_identity(&recipe, &windows_profile(), &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn identity_tracks_sensitive_settings_and_options() {
        let recipe = sample_recipe("\"os\", \"build_type\"");
        let off = BTreeMap::from([("shared".to_string(), "false".to_string())]);
        let on = BTreeMap::from([("shared".to_string(), "true".to_string())]);

        let base = package_identity(&recipe, &linux_profile(), &off);
        assert_ne!(base, package_identity(&recipe, &windows_profile(), &off));
        assert_ne!(base, package_identity(&recipe, &linux_profile(), &on));
        // Stable across repeated computation.
        assert_eq!(base, package_identity(&recipe, &linux_profile(), &off));
    }

    #[test]
    fn windows_policy_changes_file_names() {
        let win = PlatformPolicy::Windows;
        let unix = PlatformPolicy::Unix;
        assert_eq!(win.lib_filename("protobuf", false), "protobuf.lib");
        assert_eq!(unix.lib_filename("protobuf", false), "libprotobuf.a");
        assert_eq!(unix.lib_filename("protobuf", true), "libprotobuf.so");
        assert_eq!(win.executable_filename("protoc"), "protoc.exe");
        assert_eq!(unix.executable_filename("protoc"), "protoc");
    }
}
