//! Declarative source patching.
//!
//! A patch is a (file, pattern, replacement) triple applied during the
//! `source` stage; package-stage fixups reuse the same machinery against the
//! build tree. Patterns are either an exact substring or a regex. A pattern
//! that is absent from the target file fails with
//! [`Error::PatchTargetNotFound`] rather than silently succeeding, so a patch
//! written for a different upstream version (or re-applied to an
//! already-patched tree) is caught instead of skipped.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// One declared text substitution.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchDecl {
    /// Target file, relative to the tree being patched.
    pub file: String,
    /// Exact substring to replace. Mutually exclusive with `regex`.
    #[serde(default)]
    pub find: Option<String>,
    /// Regex pattern to replace. Mutually exclusive with `find`.
    #[serde(default)]
    pub regex: Option<String>,
    /// Replacement text. For regex patches, `$1`/`${name}` capture
    /// references are expanded; write `$$` for a literal `$`.
    pub replace: String,
}

impl PatchDecl {
    /// Check that exactly one of `find` / `regex` is declared.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match (&self.find, &self.regex) {
            (Some(_), Some(_)) => Err(format!(
                "patch for '{}' declares both 'find' and 'regex'",
                self.file
            )),
            (None, None) => Err(format!(
                "patch for '{}' declares neither 'find' nor 'regex'",
                self.file
            )),
            _ => Ok(()),
        }
    }

    /// The declared pattern, for error reporting.
    pub fn pattern(&self) -> &str {
        self.find
            .as_deref()
            .or(self.regex.as_deref())
            .unwrap_or_default()
    }
}

/// Apply all patches in declaration order against `root`.
///
/// Fails on the first patch whose pattern is absent; earlier patches in the
/// list stay applied (the caller re-runs the whole lifecycle from a clean
/// tree, never resumes mid-stage).
pub fn apply_patches(root: &Path, patches: &[PatchDecl]) -> Result<()> {
    for patch in patches {
        apply_patch(root, patch)?;
    }
    Ok(())
}

fn apply_patch(root: &Path, patch: &PatchDecl) -> Result<()> {
    let path = root.join(&patch.file);
    let content = fs::read_to_string(&path).map_err(|e| Error::path_io(&path, e))?;

    let patched = match (&patch.find, &patch.regex) {
        (Some(find), None) => {
            if !content.contains(find.as_str()) {
                return Err(Error::PatchTargetNotFound {
                    file: path,
                    pattern: find.clone(),
                });
            }
            content.replace(find.as_str(), &patch.replace)
        }
        (None, Some(pattern)) => {
            let re = Regex::new(pattern)?;
            if !re.is_match(&content) {
                return Err(Error::PatchTargetNotFound {
                    file: path,
                    pattern: pattern.clone(),
                });
            }
            re.replace_all(&content, patch.replace.as_str()).into_owned()
        }
        // Rejected by Recipe validation before a lifecycle ever starts.
        _ => {
            return Err(Error::Other(format!(
                "patch for '{}' must declare exactly one of 'find'/'regex'",
                patch.file
            )))
        }
    };

    debug!(file = %path.display(), "applied patch");
    fs::write(&path, patched).map_err(|e| Error::path_io(&path, e))?;
    Ok(())
}
