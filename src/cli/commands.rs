//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stratum - declarative resource graph reconciler.
#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STRATUM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "STRATUM_LOG_FORMAT")]
    pub log_format: OutputFormat,

    /// Environment whose variable overlay applies (overrides
    /// `STRATUM_PROJECT_ENVIRONMENT` and `project.environment`).
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Variable override, `NAME=VALUE`. May be repeated.
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack configuration and its resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the changes needed to match the configuration.
    Plan {
        /// Write the plan to a file for a later `apply`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,

        /// Plan the destruction of every recorded resource.
        #[arg(long)]
        destroy: bool,
    },

    /// Apply changes, either freshly planned or from a saved plan file.
    Apply {
        /// Plan file written by `plan --out`.
        plan: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum number of steps in flight.
        #[arg(long)]
        parallelism: Option<usize>,

        /// Per-step timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Walk the plan without calling providers or writing state.
        #[arg(long)]
        dry_run: bool,
    },

    /// Destroy every recorded resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Plan and apply until state matches the configuration.
    Reconcile {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum reconciliation attempts.
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Check for drift between recorded state and the providers.
    Drift,

    /// Write the providers' current attributes back to state.
    Refresh,

    /// Resolve records left pending by an interrupted apply.
    Recover,

    /// Show stack outputs.
    Output {
        /// Output name (shows all outputs if not specified).
        name: Option<String>,
    },

    /// Manage recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded resources.
    List,

    /// Show one record.
    Show {
        /// Resource address, e.g. `network.main`.
        address: String,
    },

    /// Forget a resource without destroying it.
    Rm {
        /// Resource address.
        address: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "stratum", "plan", "--env", "prod", "--var", "replicas=3", "--var", "cidr=10.1.0.0/16",
            "--output", "json",
        ])
        .unwrap();

        assert_eq!(cli.env.as_deref(), Some("prod"));
        assert_eq!(cli.vars, vec!["replicas=3", "cidr=10.1.0.0/16"]);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Plan {
                destroy: false,
                ..
            }
        ));
    }

    #[test]
    fn test_apply_with_plan_file() {
        let cli = Cli::try_parse_from(["stratum", "apply", "plan.json", "--yes", "--parallelism", "2"])
            .unwrap();

        let Commands::Apply {
            plan,
            yes,
            parallelism,
            ..
        } = cli.command
        else {
            panic!("expected apply");
        };
        assert_eq!(plan, Some(PathBuf::from("plan.json")));
        assert!(yes);
        assert_eq!(parallelism, Some(2));
    }

    #[test]
    fn test_state_subcommands() {
        let cli = Cli::try_parse_from(["stratum", "state", "rm", "module.app.service.api"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Rm { .. }
            }
        ));
    }
}
