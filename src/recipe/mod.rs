//! Recipe file format and loading.
//!
//! Recipes are TOML files describing how to obtain, patch, build, package,
//! and export one versioned library. A recipe is immutable once loaded;
//! everything the lifecycle does is driven by these declarations plus the
//! active settings profile.
//!
//! Argument templates and copy-rule sources support `%(var)s` substitution
//! (name, version, node paths, `opt:<option>`, `dep:<name>` package dirs).

pub mod reference;

use std::collections::BTreeMap;
use std::path::Path;

use semver::Version;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::patch::PatchDecl;
use crate::profile::{SettingKey, SettingsPredicate};

pub use reference::RecipeReference;

/// Generator names the export stage understands.
pub const KNOWN_GENERATORS: &[&str] = &["json", "env"];

/// A complete recipe, parsed and validated.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub package: PackageSection,

    /// Configurable options with enumerated domains.
    #[serde(default)]
    pub options: BTreeMap<String, OptionDecl>,

    /// Option values this recipe forces onto its dependencies.
    #[serde(default)]
    pub propagate: Vec<PropagateDecl>,

    pub source: SourceSection,

    #[serde(default)]
    pub build: BuildSection,

    #[serde(default)]
    pub package_rules: PackageRules,

    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSection {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Direct dependency requirements.
    #[serde(default)]
    pub requires: Vec<RecipeReference>,
    /// Settings this recipe's binary identity is sensitive to.
    #[serde(default)]
    pub settings: Vec<SettingKey>,
}

/// One option: an enumerated string domain and its default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionDecl {
    pub values: Vec<String>,
    pub default: String,
}

impl OptionDecl {
    pub fn allows(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn allowed(&self) -> String {
        self.values.join(", ")
    }
}

/// A forced option assignment on a direct dependency.
///
/// Exactly one of `value` (fixed) or `from` (forward this recipe's own
/// resolved value for the named option) must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropagateDecl {
    pub dependency: String,
    pub option: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    /// Upstream artifact URL (`http://`, `https://`, or `file://`).
    pub url: String,
    /// Expected sha256 of the downloaded artifact. Optional only under a
    /// relaxed checksum policy.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Directory the archive unpacks into, relative to the node's source
    /// directory. Also the marker that unpacking already happened.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default, rename = "patch")]
    pub patches: Vec<PatchDecl>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    #[serde(default, rename = "step")]
    pub steps: Vec<BuildStep>,
}

/// One external-tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildStep {
    /// Tool name, resolved on PATH at run time.
    pub tool: String,
    /// Argument templates, `%(var)s`-substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the node's build directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Arguments appended only when their predicate matches.
    #[serde(default, rename = "arg")]
    pub conditional_args: Vec<ConditionalArg>,
    /// Skip the whole step unless this predicate matches.
    #[serde(default)]
    pub when: Option<SettingsPredicate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalArg {
    pub value: String,
    pub when: SettingsPredicate,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageRules {
    /// Fixups applied to the build tree before copy rules run (the upstream
    /// install step often bakes in paths that must be rewritten).
    #[serde(default, rename = "patch")]
    pub patches: Vec<PatchDecl>,
    #[serde(default, rename = "copy")]
    pub copy: Vec<CopyRule>,
}

/// A (glob pattern, source subdirectory, destination category) copy rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyRule {
    /// Glob matched against paths relative to `from` (and against bare file
    /// names, so `*.h` picks up nested headers).
    pub pattern: String,
    /// Source subdirectory, `%(var)s`-substituted, relative to the node's
    /// build directory unless the rendered value is absolute.
    #[serde(default)]
    pub from: String,
    /// Destination category inside the package (`include`, `lib`, `bin`,
    /// or `.` for build-system descriptors at the package root).
    pub to: String,
    /// Preserve the relative directory structure under the destination.
    #[serde(default = "default_true")]
    pub keep_paths: bool,
    /// Fail with `MissingArtifact` when the rule matches zero files.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub when: Option<SettingsPredicate>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportSection {
    #[serde(default, rename = "lib")]
    pub libs: Vec<ExportedLib>,
    #[serde(default, rename = "define")]
    pub defines: Vec<ExportedDefine>,
    /// Metadata emitters to run after packaging. `json` is always implied.
    #[serde(default)]
    pub generators: Vec<String>,
}

/// Whether an exported library follows the static or shared naming rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibKind {
    /// Follow the conventional `shared` option when the recipe declares one.
    #[default]
    Auto,
    Static,
    Shared,
}

/// A library consumers must link, named per build type and platform policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportedLib {
    /// Link base name (`protobuf`, not `libprotobuf.a`).
    pub name: String,
    /// Suffix appended to the base name for debug builds (`d` turns
    /// `protobuf` into `protobufd`).
    #[serde(default)]
    pub debug_suffix: Option<String>,
    #[serde(default)]
    pub kind: LibKind,
    #[serde(default)]
    pub when: Option<SettingsPredicate>,
}

/// A preprocessor define consumers must set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportedDefine {
    pub name: String,
    #[serde(default)]
    pub when: Option<SettingsPredicate>,
}

impl Recipe {
    /// Load and validate a recipe from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recipe");
        let recipe: Recipe = toml::from_str(&text).map_err(|e| Error::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        recipe.validate(name)?;
        Ok(recipe)
    }

    /// Parse and validate a recipe from a TOML string. `origin` is used in
    /// error messages only.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self> {
        let recipe: Recipe = toml::from_str(text).map_err(|e| Error::Parse {
            path: origin.into(),
            reason: e.to_string(),
        })?;
        recipe.validate(origin)?;
        Ok(recipe)
    }

    fn invalid(&self, reason: String) -> Error {
        Error::InvalidRecipe {
            name: self.package.name.clone(),
            reason,
        }
    }

    fn validate(&self, origin: &str) -> Result<()> {
        if self.package.name.is_empty() {
            return Err(Error::InvalidRecipe {
                name: origin.to_string(),
                reason: "package.name is empty".to_string(),
            });
        }

        for (name, decl) in &self.options {
            if decl.values.is_empty() {
                return Err(self.invalid(format!("option '{}' has an empty value domain", name)));
            }
            if !decl.allows(&decl.default) {
                return Err(self.invalid(format!(
                    "default {:?} for option '{}' is outside its domain ({})",
                    decl.default,
                    name,
                    decl.allowed()
                )));
            }
        }

        for decl in &self.propagate {
            match (&decl.value, &decl.from) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(self.invalid(format!(
                        "propagation to '{}.{}' must set exactly one of 'value'/'from'",
                        decl.dependency, decl.option
                    )));
                }
                (None, Some(from)) if !self.options.contains_key(from) => {
                    return Err(self.invalid(format!(
                        "propagation to '{}.{}' forwards undeclared option '{}'",
                        decl.dependency, decl.option, from
                    )));
                }
                _ => {}
            }
            if !self.package.requires.iter().any(|r| r.name == decl.dependency) {
                return Err(self.invalid(format!(
                    "propagation targets '{}', which is not a declared requirement",
                    decl.dependency
                )));
            }
        }

        if let Some(sha256) = &self.source.sha256 {
            if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(self.invalid("source.sha256 is not a 64-char hex digest".to_string()));
            }
        }

        for patch in self.source.patches.iter().chain(&self.package_rules.patches) {
            patch.validate().map_err(|reason| self.invalid(reason))?;
        }

        for rule in &self.package_rules.copy {
            if rule.pattern.is_empty() {
                return Err(self.invalid("package copy rule with empty pattern".to_string()));
            }
            if rule.to.is_empty() {
                return Err(self.invalid(format!(
                    "copy rule {:?} has an empty destination category",
                    rule.pattern
                )));
            }
        }

        for generator in &self.export.generators {
            if !KNOWN_GENERATORS.contains(&generator.as_str()) {
                return Err(self.invalid(format!(
                    "unknown generator '{}' (known: {})",
                    generator,
                    KNOWN_GENERATORS.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Option defaults as a resolved value map.
    pub fn default_options(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .map(|(name, decl)| (name.clone(), decl.default.clone()))
            .collect()
    }

    /// The archive file name implied by the source URL.
    pub fn archive_filename(&self) -> String {
        self.source
            .url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("source.tar.gz")
            .to_string()
    }
}

/// Substitute `%(var)s` patterns from `vars`, leaving unknown patterns
/// untouched.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("%({})s", key), value);
    }
    result
}
