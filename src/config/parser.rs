//! Configuration parser for loading stack files.
//!
//! This module handles loading configuration from YAML files, inlining
//! module files referenced through `source`, and applying environment
//! variable overrides with proper precedence and error handling.

use crate::error::{ConfigError, Result, StratumError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{ModuleConfig, ModuleSource, StackConfig};

/// Prefix of environment variables overriding root variables.
pub const VARIABLE_ENV_PREFIX: &str = "STRATUM_VAR_";

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file, inlining module sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or a module file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = read_file(path)?;
        let mut config = self.parse_yaml(&content, Some(path))?;

        let base_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut stack = vec![canonical(path)];
        resolve_sources(&mut config.modules, &base_dir, &mut stack)?;

        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// Module `source` paths are not resolved; use [`ConfigParser::load_file`]
    /// for stacks that reference module files.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StratumError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Successfully parsed configuration for project: {}",
            config.project.name
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `STRATUM_<SECTION>_<KEY>` (e.g., `STRATUM_PROJECT_ENVIRONMENT`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;

        // Apply environment overrides
        Self::apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut StackConfig) {
        // Project overrides
        if let Ok(name) = std::env::var("STRATUM_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("STRATUM_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        // State overrides
        if let Ok(bucket) = std::env::var("STRATUM_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("STRATUM_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(path) = std::env::var("STRATUM_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }
    }

    /// Collects root variable overrides from `STRATUM_VAR_<NAME>` variables.
    ///
    /// Values are parsed as YAML scalars, so `3` becomes a number and `true`
    /// a boolean; anything unparseable is kept as a string.
    #[must_use]
    pub fn variable_overrides_from_env() -> BTreeMap<String, Value> {
        variable_overrides(std::env::vars())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StratumError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Parses a `NAME=VALUE` variable assignment given on the command line.
///
/// # Errors
///
/// Returns an error if the assignment has no `=` or an empty name.
pub fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    match assignment.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), parse_scalar(value)))
        }
        _ => Err(ConfigError::validation(
            format!("expected NAME=VALUE, found '{assignment}'"),
            "var",
        )
        .into()),
    }
}

fn variable_overrides(vars: impl Iterator<Item = (String, String)>) -> BTreeMap<String, Value> {
    vars.filter_map(|(key, value)| {
        key.strip_prefix(VARIABLE_ENV_PREFIX)
            .filter(|name| !name.is_empty())
            .map(|name| (name.to_string(), parse_scalar(&value)))
    })
    .collect()
}

fn parse_scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(StratumError::Config(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }));
    }

    std::fs::read_to_string(path).map_err(|e| {
        StratumError::Config(ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })
    })
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Inlines modules declared with `source`, recursively.
fn resolve_sources(modules: &mut [ModuleConfig], base_dir: &Path, stack: &mut Vec<PathBuf>) -> Result<()> {
    for module in modules.iter_mut() {
        let Some(source) = module.source.clone() else {
            let mut nested = std::mem::take(&mut module.modules);
            resolve_sources(&mut nested, base_dir, stack)?;
            module.modules = nested;
            continue;
        };

        if !module.is_empty() {
            return Err(ConfigError::validation(
                format!(
                    "module '{}' has both a source and an inline body",
                    module.name
                ),
                format!("modules.{}.source", module.name),
            )
            .into());
        }

        let path = base_dir.join(&source);
        let key = canonical(&path);
        if stack.contains(&key) {
            return Err(ConfigError::validation(
                format!(
                    "module source '{}' includes itself",
                    path.display()
                ),
                format!("modules.{}.source", module.name),
            )
            .into());
        }

        debug!("Loading module '{}' from {}", module.name, path.display());
        let content = read_file(&path)?;
        let mut body: ModuleSource = serde_yaml::from_str(&content).map_err(|e| {
            StratumError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let module_dir = path
            .parent()
            .map_or_else(|| base_dir.to_path_buf(), Path::to_path_buf);
        stack.push(key);
        resolve_sources(&mut body.modules, &module_dir, stack)?;
        stack.pop();

        module.inline(body);
    }

    Ok(())
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stratum.yaml", "stratum.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StratumError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(StratumError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let parser = ConfigParser::new();
        let result = parser.load_file("/nonexistent/stratum.yaml");
        assert!(matches!(
            result,
            Err(StratumError::Config(ConfigError::FileNotFound { .. }))
        ));
    }

    #[test]
    fn test_module_source_inlined() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("modules")).unwrap();
        std::fs::write(
            dir.path().join("modules/db.yaml"),
            r#"
variables:
  size:
    default: small
resources:
  - type: instance
    name: primary
    attributes:
      size: "${var.size}"
outputs:
  endpoint: "${instance.primary.id}"
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("stratum.yaml"),
            r"
project:
  name: demo
modules:
  - name: db
    source: modules/db.yaml
    inputs:
      size: large
",
        )
        .unwrap();

        let config = ConfigParser::new()
            .load_file(dir.path().join("stratum.yaml"))
            .unwrap();
        let db = &config.modules[0];
        assert_eq!(db.resources.len(), 1);
        assert!(db.outputs.contains_key("endpoint"));
        assert_eq!(db.variables["size"].default, Some(json!("small")));
    }

    #[test]
    fn test_module_source_cycle() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("loop.yaml"),
            r"
modules:
  - name: again
    source: loop.yaml
",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("stratum.yaml"),
            r"
project:
  name: demo
modules:
  - name: first
    source: loop.yaml
",
        )
        .unwrap();

        let result = ConfigParser::new().load_file(dir.path().join("stratum.yaml"));
        assert!(matches!(
            result,
            Err(StratumError::Config(ConfigError::ValidationError { .. }))
        ));
    }

    #[test]
    fn test_variable_overrides() {
        let vars = vec![
            (String::from("STRATUM_VAR_replicas"), String::from("3")),
            (String::from("STRATUM_VAR_region"), String::from("eu-west-1")),
            (String::from("STRATUM_VAR_"), String::from("ignored")),
            (String::from("HOME"), String::from("/root")),
        ];
        let overrides = variable_overrides(vars.into_iter());
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides["replicas"], json!(3));
        assert_eq!(overrides["region"], json!("eu-west-1"));
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("enabled=true").unwrap(),
            (String::from("enabled"), json!(true))
        );
        assert_eq!(
            parse_assignment("cidr=10.0.0.0/16").unwrap(),
            (String::from("cidr"), json!("10.0.0.0/16"))
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("stratum.yaml"), "project:\n  name: x\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stratum.yaml"));
    }
}
