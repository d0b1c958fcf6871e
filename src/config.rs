//! Build description parsing for bob.toml
//!
//! Handles loading and validating the declarative project description and
//! turning it into a [`Project`] with one [`CommandGenerator`] per
//! `[generators.<ext>]` table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{BobError, Result};
use crate::generator::CommandGenerator;
use crate::project::{dedup_paths, Project};
use crate::scan::IncludeScanner;
use crate::substitute::{Value, Vars};

/// Default description file names to search for
pub const CONFIG_FILES: &[&str] = &["bob.toml", "Bob.toml"];

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub project: ProjectConfig,

    /// Base substitution variables shared by all generators
    #[serde(default)]
    pub vars: BTreeMap<String, toml::Value>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Generators keyed by extension
    #[serde(default)]
    pub generators: BTreeMap<String, GeneratorConfig>,
}

/// What to build and where
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Output root
    pub build_dir: PathBuf,

    /// Input glob patterns
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Patterns removed from the inputs
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Include search paths; `~` and `$VAR` are expanded
    #[serde(default)]
    pub includes: Vec<String>,
}

/// Global settings for bob behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Default parallelism level (0 = number of CPUs)
    #[serde(default)]
    pub parallelism: usize,

    /// Skip up-to-date tasks
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: 0,
            cache: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Scanners selectable from a description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    Include,
}

/// Configuration for one command generator
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Task name (defaults to the extension)
    #[serde(default)]
    pub name: Option<String>,

    /// Command template, see [`crate::substitute`]
    pub command: String,

    /// Extension of the mirrored output
    pub output_ext: String,

    /// Dependency scanner
    #[serde(default)]
    pub scanner: Option<ScannerKind>,

    /// Timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Variables overriding `[vars]` for this generator
    #[serde(default)]
    pub vars: BTreeMap<String, toml::Value>,
}

impl Config {
    /// Load configuration from the specified path or search for it
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let config_path = match path {
            Some(p) => {
                if p.exists() {
                    p.to_path_buf()
                } else {
                    return Err(BobError::ConfigNotFound {
                        searched: vec![p.to_path_buf()],
                    });
                }
            }
            None => Self::find_config()?,
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config = Self::parse(&content, &config_path)?;

        Ok((config, config_path))
    }

    /// Parse and validate description text
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| BobError::ConfigParse {
            source: e,
            path: path.to_path_buf(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Search for config file starting from current directory
    fn find_config() -> Result<PathBuf> {
        let mut current = std::env::current_dir()?;
        let mut searched = Vec::new();

        loop {
            for name in CONFIG_FILES {
                let candidate = current.join(name);
                searched.push(candidate.clone());
                if candidate.exists() {
                    return Ok(candidate);
                }
            }

            if !current.pop() {
                break;
            }
        }

        Err(BobError::ConfigNotFound { searched })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.project.build_dir.as_os_str().is_empty() {
            return Err(invalid("project.build_dir must not be empty"));
        }

        for (ext, generator) in &self.generators {
            if generator.command.trim().is_empty() {
                return Err(invalid(format!("generator '{ext}' has an empty command")));
            }

            if !generator.output_ext.starts_with('.') || generator.output_ext.len() < 2 {
                return Err(invalid(format!(
                    "generator '{ext}' output_ext must look like '.o', got '{}'",
                    generator.output_ext
                )));
            }

            if generator.timeout == Some(0) {
                return Err(invalid(format!("generator '{ext}' timeout must be positive")));
            }

            to_vars(&generator.vars)?;
        }

        to_vars(&self.vars)?;
        Ok(())
    }

    /// Base substitution variables
    pub fn base_vars(&self) -> Result<Vars> {
        to_vars(&self.vars)
    }

    /// Expand input globs relative to the working directory
    pub fn resolve_inputs(&self) -> Result<Vec<PathBuf>> {
        let exclude = build_globset(&self.project.exclude)?;
        let mut inputs = Vec::new();

        for pattern in &self.project.inputs {
            let paths = glob::glob(pattern)
                .map_err(|e| invalid(format!("invalid input pattern '{pattern}': {e}")))?;
            for path in paths.filter_map(|p| p.ok()) {
                if path.is_file() && !exclude.is_match(&path) {
                    inputs.push(path);
                }
            }
        }

        inputs.sort();
        Ok(dedup_paths(inputs))
    }

    /// Include paths with `~` and environment variables expanded
    pub fn resolve_includes(&self) -> Result<Vec<String>> {
        self.project
            .includes
            .iter()
            .map(|inc| {
                shellexpand::full(inc)
                    .map(|s| s.into_owned())
                    .map_err(|e| invalid(format!("cannot expand include path '{inc}': {e}")))
            })
            .collect()
    }

    /// Build the project described by this configuration
    pub fn to_project(&self) -> Result<Project> {
        let project = Project::new(
            &self.project.build_dir,
            self.resolve_inputs()?,
            self.resolve_includes()?,
        );

        let base = self.base_vars()?;
        for (ext, generator) in &self.generators {
            let vars = Vars::merged(&[&base, &to_vars(&generator.vars)?]);
            let name = generator
                .name
                .clone()
                .unwrap_or_else(|| ext.trim_start_matches('.').to_string());

            let mut factory = CommandGenerator::new(name, &generator.command, &generator.output_ext)
                .vars(vars);
            if let Some(ScannerKind::Include) = generator.scanner {
                factory = factory.scanner(IncludeScanner);
            }
            if let Some(secs) = generator.timeout {
                factory = factory.timeout(Duration::from_secs(secs));
            }

            project.register(ext, factory);
        }

        Ok(project)
    }
}

fn invalid(reason: impl Into<String>) -> BobError {
    BobError::InvalidConfig {
        reason: reason.into(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| invalid(format!("invalid exclude pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| invalid(format!("failed to build exclude set: {e}")))
}

/// Convert TOML variables into substitution values
fn to_vars(table: &BTreeMap<String, toml::Value>) -> Result<Vars> {
    table
        .iter()
        .map(|(key, value)| Ok((key.as_str(), to_value(key, value)?)))
        .collect()
}

fn to_value(key: &str, value: &toml::Value) -> Result<Value> {
    match value {
        toml::Value::Array(items) => items
            .iter()
            .map(|item| scalar(key, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        other => scalar(key, other).map(Value::Scalar),
    }
}

fn scalar(key: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(invalid(format!(
            "variable '{key}' must be a scalar or a flat array"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"
        [project]
        build_dir = "build"
        inputs = ["src/*.c"]
        includes = ["include"]

        [vars]
        CC = "cc"
        CFLAGS = ["-O2", "-Wall"]
        JOBS = 4

        [generators.c]
        command = "${CC} ${CFLAGS} -I${INCLUDES} -c ${INPUTS} -o ${OUTPUTS[0]}"
        output_ext = ".o"
        scanner = "include"
        timeout = 60
        vars = { CFLAGS = ["-O0"] }
    "#;

    #[test]
    fn test_parse_simple_config() {
        let config = Config::parse(SIMPLE, Path::new("bob.toml")).unwrap();
        assert_eq!(config.project.build_dir, PathBuf::from("build"));
        assert_eq!(config.generators.len(), 1);
        assert_eq!(config.generators["c"].scanner, Some(ScannerKind::Include));
        assert!(config.settings.cache);

        let vars = config.base_vars().unwrap();
        assert_eq!(vars.get("jobs"), Some(&Value::Scalar("4".into())));
        assert_eq!(
            vars.get("cflags"),
            Some(&Value::List(vec!["-O2".into(), "-Wall".into()]))
        );
    }

    #[test]
    fn test_unknown_scanner_rejected() {
        let text = SIMPLE.replace("scanner = \"include\"", "scanner = \"magic\"");
        let err = Config::parse(&text, Path::new("bob.toml")).unwrap_err();
        assert!(matches!(err, BobError::ConfigParse { .. }));
    }

    #[test]
    fn test_bad_output_ext_rejected() {
        let text = SIMPLE.replace("output_ext = \".o\"", "output_ext = \"o\"");
        let err = Config::parse(&text, Path::new("bob.toml")).unwrap_err();
        assert!(matches!(err, BobError::InvalidConfig { .. }));
    }

    #[test]
    fn test_nested_table_var_rejected() {
        let text = SIMPLE.replace("JOBS = 4", "JOBS = { a = 1 }");
        let err = Config::parse(&text, Path::new("bob.toml")).unwrap_err();
        assert!(matches!(err, BobError::InvalidConfig { .. }));
    }

    #[test]
    fn test_to_project_registers_generators() {
        let config = Config::parse(SIMPLE, Path::new("bob.toml")).unwrap();
        let project = config.to_project().unwrap();
        assert_eq!(project.generator_extensions(), vec![".c".to_string()]);
        assert_eq!(project.includes(), ["include".to_string()]);
        assert!(project.generator_for(Path::new("x.c")).is_some());
        assert!(project.generator_for(Path::new("x.h")).is_none());
    }
}
