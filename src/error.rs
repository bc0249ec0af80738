//! Error taxonomy for recipe resolution and lifecycle execution.
//!
//! Every stage failure aborts the owning node's lifecycle immediately and is
//! surfaced wrapped in [`Error::Stage`] so callers can see the node identity
//! and stage name without re-running.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Network or URL failure while fetching an upstream artifact.
    #[error("failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// Downloaded artifact does not match the declared digest.
    #[error("checksum mismatch for '{path}': expected sha256 {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Recipe declares no digest and the checksum policy is fail-closed.
    #[error(
        "recipe '{recipe}' declares no sha256 for its source archive; \
         declare one or relax the checksum policy to 'warn'"
    )]
    ChecksumMissing { recipe: String },

    /// A declared patch pattern is absent from its target file. Raised both
    /// for patches written against a different upstream version and for
    /// re-application to an already-patched tree.
    #[error("patch target not found in '{file}': pattern {pattern:?} is absent")]
    PatchTargetNotFound { file: PathBuf, pattern: String },

    /// External build tool exited nonzero. `code` is -1 when the process was
    /// terminated by a signal.
    #[error("build tool '{tool}' failed with exit code {code}\n{output}")]
    BuildToolInvocation {
        tool: String,
        code: i32,
        output: String,
    },

    /// External build tool exceeded the configured wall-clock timeout.
    #[error("build tool '{tool}' exceeded the {seconds}s timeout and was killed")]
    BuildTimeout { tool: String, seconds: u64 },

    /// A build step names a tool that is not on PATH.
    #[error("build tool '{tool}' not found on PATH")]
    BuildToolMissing { tool: String },

    /// Preflight found tools the graph needs but the host lacks.
    #[error("missing required host tools: {}", tools.join(", "))]
    MissingHostTools { tools: Vec<String> },

    /// A required package copy rule matched zero files.
    #[error(
        "required package rule matched no files: pattern {pattern:?} \
         under '{from}' (destination '{to}')"
    )]
    MissingArtifact {
        pattern: String,
        from: String,
        to: String,
    },

    /// Two dependents force different values onto the same dependency option.
    #[error(
        "conflicting values for option '{dependency}.{option}': \
         '{first_dependent}' wants {first_value:?}, \
         '{second_dependent}' wants {second_value:?}"
    )]
    OptionConflict {
        dependency: String,
        option: String,
        first_dependent: String,
        first_value: String,
        second_dependent: String,
        second_value: String,
    },

    /// An option name that the target recipe does not declare.
    #[error("recipe '{recipe}' has no option named '{option}'")]
    UnknownOption { recipe: String, option: String },

    /// A value outside the option's declared domain.
    #[error("value {value:?} is not allowed for '{recipe}.{option}' (allowed: {allowed})")]
    InvalidOptionValue {
        recipe: String,
        option: String,
        value: String,
        allowed: String,
    },

    /// The dependency graph is not acyclic.
    #[error("dependency cycle involving: {0}")]
    DependencyCycle(String),

    /// Two requirements pin different versions of the same dependency.
    #[error("conflicting requirements for '{name}': {first} and {second}")]
    RequirementConflict {
        name: String,
        first: String,
        second: String,
    },

    /// No recipe file found for a requirement on the search path.
    #[error("no recipe found for '{reference}' (searched: {searched})")]
    RecipeNotFound { reference: String, searched: String },

    /// A recipe file declares a different identity than the requirement asked for.
    #[error("recipe at '{path}' declares '{found}' but the requirement was '{requested}'")]
    RequirementMismatch {
        path: PathBuf,
        found: String,
        requested: String,
    },

    /// A malformed `name/version@channel` requirement string.
    #[error("invalid requirement '{input}': {reason}")]
    InvalidReference { input: String, reason: String },

    /// A recipe that parsed but failed semantic validation.
    #[error("invalid recipe '{name}': {reason}")]
    InvalidRecipe { name: String, reason: String },

    /// Expected archive root directory missing after unpack.
    #[error("source root '{expected}' missing after unpacking '{archive}'")]
    SourceRootMissing { expected: PathBuf, archive: PathBuf },

    /// Lifecycle stages invoked out of order.
    #[error("node '{node}': stage '{stage}' requires state {expected}, current state is {actual}")]
    StageOrder {
        node: String,
        stage: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// A stage failure, wrapped with the owning node and stage name.
    #[error("node '{node}': stage '{stage}' failed: {source}")]
    Stage {
        node: String,
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// The run was cancelled before this node could proceed.
    #[error("cancelled")]
    Cancelled,

    /// I/O failure with the path it happened on.
    #[error("io error on '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// TOML or JSON input that failed to parse.
    #[error("failed to parse '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a stage failure with its node identity and stage name.
    pub fn in_stage(self, node: &str, stage: &'static str) -> Self {
        Error::Stage {
            node: node.to_string(),
            stage,
            source: Box::new(self),
        }
    }

    /// I/O error annotated with the offending path.
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PathIo {
            path: path.into(),
            source,
        }
    }
}
