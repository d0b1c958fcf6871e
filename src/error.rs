//! Error types for bob
//!
//! Uses `miette` for pretty error reporting with help text. Only
//! configuration errors travel through this type out of a build; task
//! failures are reported as data in [`crate::BuildResult`].

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for bob operations
#[derive(Error, Diagnostic, Debug)]
pub enum BobError {
    #[error("Build description not found")]
    #[diagnostic(
        code(bob::config::not_found),
        help("Create a bob.toml in your project root, or specify one with --config")
    )]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse build description {}", path.display())]
    #[diagnostic(code(bob::config::parse))]
    ConfigParse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("Invalid build description: {reason}")]
    #[diagnostic(code(bob::config::invalid))]
    InvalidConfig { reason: String },

    #[error("Undefined substitution key '{key}'")]
    #[diagnostic(
        code(bob::substitute::undefined_key),
        help("Define the key in one of the configuration mappings passed to substitute")
    )]
    UndefinedKey { key: String },

    #[error("Cannot look up '{key}[{index}]': {reason}")]
    #[diagnostic(code(bob::substitute::lookup))]
    Lookup {
        key: String,
        index: usize,
        reason: String,
    },

    #[error("No task generator registered for extension '{ext}'")]
    #[diagnostic(
        code(bob::generator::missing),
        help("Register a factory for this extension, or a wildcard '*' factory")
    )]
    NoGenerator { ext: String, input: PathBuf },

    #[error("Task generator failed for {}: {message}", input.display())]
    #[diagnostic(code(bob::generator::failed))]
    Generator { input: PathBuf, message: String },

    #[error("Circular dependency detected: {cycle}")]
    #[diagnostic(
        code(bob::graph::cycle),
        help("A task consumes, directly or through another task, a file it produces")
    )]
    CyclicDependency { cycle: String },

    #[error("Scan of {} failed: {reason}", path.display())]
    #[diagnostic(code(bob::scan))]
    Scan { path: PathBuf, reason: String },

    #[error("Cache error: {message}")]
    #[diagnostic(code(bob::cache))]
    Cache { message: String },

    #[error("Transcoding {} failed: {message}", path.display())]
    #[diagnostic(code(bob::transcode))]
    Transcode { path: PathBuf, message: String },

    #[error("I/O error")]
    #[diagnostic(code(bob::io))]
    Io(#[from] std::io::Error),
}

impl BobError {
    /// Whether this error belongs to the fail-fast configuration class
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BobError::ConfigNotFound { .. }
                | BobError::ConfigParse { .. }
                | BobError::InvalidConfig { .. }
                | BobError::UndefinedKey { .. }
                | BobError::Lookup { .. }
                | BobError::NoGenerator { .. }
                | BobError::Generator { .. }
                | BobError::CyclicDependency { .. }
        )
    }
}

/// Result type alias for bob operations
pub type Result<T> = std::result::Result<T, BobError>;
