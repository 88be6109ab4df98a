//! Configuration module for the reconciler.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stratum.yaml` and module files
//! - Environment overlays and `STRATUM_*` overrides
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, VARIABLE_ENV_PREFIX, find_config_file, parse_assignment,
};
pub use spec::{
    EnvironmentConfig, ExecutionConfig, ModuleConfig, ModuleSource, ProjectConfig, ProviderConfig,
    ResourceConfig, StackConfig, StateBackend, StateConfig, VariableConfig,
};
pub use validator::{ConfigValidator, KNOWN_ENVIRONMENTS, ValidationError, ValidationResult};
