//! Stratum CLI entrypoint.
//!
//! This is the main entrypoint for the stratum command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use stratum::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use stratum::config::{
    ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file, parse_assignment,
};
use stratum::error::{ConfigError, Result, StratumError};
use stratum::graph::{ResourceId, render_scalar};
use stratum::planner::{ExecutorOptions, Plan};
use stratum::provider::ProviderRegistry;
use stratum::reconciler::Reconciler;
use stratum::state::{
    LocalStateStore, MemoryStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over `--verbose` when set.
fn init_logging(verbose: bool, format: OutputFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// A loaded stack with its state backend.
struct Stack {
    config: StackConfig,
    store: Arc<dyn StateStore>,
    environment: String,
    overrides: BTreeMap<String, Value>,
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match &cli.command {
        Commands::Init { path, force } => cmd_init(path, *force),
        Commands::Validate { warnings } => cmd_validate(&cli, *warnings, &formatter),
        Commands::Plan {
            out,
            detailed,
            destroy,
        } => cmd_plan(&cli, out.as_deref(), *detailed, *destroy, &formatter).await,
        Commands::Apply {
            plan,
            yes,
            parallelism,
            timeout,
            dry_run,
        } => {
            let stack = load_stack(&cli).await?;
            let mut options = ExecutorOptions::from_config(&stack.config.execution);
            if let Some(parallelism) = parallelism {
                options.parallelism = (*parallelism).max(1);
            }
            if let Some(secs) = timeout {
                options.step_timeout = Some(Duration::from_secs(*secs));
            }
            options.dry_run = *dry_run;
            cmd_apply(stack, plan.as_deref(), *yes, options, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(&cli, *yes, &formatter).await,
        Commands::Reconcile { yes, max_attempts } => {
            cmd_reconcile(&cli, *yes, *max_attempts, &formatter).await
        }
        Commands::Drift => {
            let reconciler = reconciler(load_stack(&cli).await?)?;
            let report = reconciler.check_drift().await?;
            println!("{}", formatter.format_drift(&report));
            Ok(())
        }
        Commands::Refresh => {
            let reconciler = reconciler(load_stack(&cli).await?)?;
            let report = reconciler.refresh().await?;
            println!("{}", formatter.format_drift(&report));
            Ok(())
        }
        Commands::Recover => {
            let reconciler = reconciler(load_stack(&cli).await?)?;
            let report = reconciler.recover().await?;
            println!("{}", formatter.format_recovery(&report));
            Ok(())
        }
        Commands::Output { name } => cmd_output(&cli, name.as_deref(), &formatter).await,
        Commands::State { command } => cmd_state(&cli, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stratum.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stratum.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stratum")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stratum.yaml with your resources");
    eprintln!("  2. Run 'stratum validate' to check your configuration");
    eprintln!("  3. Run 'stratum plan' to see what will change");
    eprintln!("  4. Run 'stratum apply' to apply it");

    Ok(())
}

/// Validate configuration and build the resource graph.
fn cmd_validate(cli: &Cli, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config_file, config) = load_config(cli)?;
    info!("Validating configuration: {}", config_file.display());

    let environment = cli
        .env
        .clone()
        .unwrap_or_else(|| config.project.environment.clone());

    let validator = ConfigValidator::new();
    let result = validator.check(&config);
    let resources = if result.is_valid() {
        let overrides = variable_overrides(cli)?;
        stratum::graph::GraphBuilder::new(&config)
            .environment(environment.clone())
            .variables(overrides)
            .build()?
            .len()
    } else {
        config.resource_count()
    };

    println!(
        "{}",
        formatter.format_validation(&config, &environment, &result, resources, show_warnings)
    );

    validator.validate(&config).map(|_| ())
}

/// Show the plan and optionally save it.
async fn cmd_plan(
    cli: &Cli,
    out: Option<&Path>,
    detailed: bool,
    destroy: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = reconciler(load_stack(cli).await?)?;
    let plan = if destroy {
        reconciler.plan_destroy().await?
    } else {
        reconciler.plan().await?
    };

    println!("{}", formatter.format_plan(&plan, detailed));

    if let Some(path) = out {
        std::fs::write(path, plan.to_json()?)?;
        eprintln!("Plan saved to {}", path.display());
        eprintln!("Run 'stratum apply {}' to apply it.", path.display());
    }

    Ok(())
}

/// Apply a saved or freshly computed plan.
async fn cmd_apply(
    stack: Stack,
    plan_file: Option<&Path>,
    auto_approve: bool,
    options: ExecutorOptions,
    formatter: &OutputFormatter,
) -> Result<()> {
    let production = stack.config.is_production() || stack.environment == "prod";
    let dry_run = options.dry_run;
    let reconciler = reconciler(stack)?.with_options(options);

    let plan = match plan_file {
        Some(path) => {
            debug!("Loading plan from {}", path.display());
            Plan::from_json(&std::fs::read_to_string(path)?)?
        }
        None => reconciler.plan().await?,
    };

    if !plan.has_changes() {
        eprintln!("{}", formatter.success("No changes to apply."));
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&plan, false));

    if !auto_approve && !dry_run {
        let confirmed = if production {
            confirm(&format!(
                "Environment '{}' is production. Type the environment name to apply: ",
                plan.environment
            ))?
            .eq(&plan.environment)
        } else {
            confirm("Do you want to apply this plan? [y/N]: ")?.eq_ignore_ascii_case("y")
        };
        if !confirmed {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    run_apply(&reconciler, &plan, formatter).await
}

/// Destroy every recorded resource.
async fn cmd_destroy(cli: &Cli, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = reconciler(load_stack(cli).await?)?;
    let plan = reconciler.plan_destroy().await?;

    if !plan.has_changes() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&plan, false));

    if !auto_approve {
        let input = confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ")?;
        if input != "destroy" {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    run_apply(&reconciler, &plan, formatter).await
}

/// Reconcile until converged.
async fn cmd_reconcile(
    cli: &Cli,
    auto_approve: bool,
    max_attempts: Option<u32>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let stack = load_stack(cli).await?;

    if !auto_approve {
        let input = confirm(
            "This will apply every change needed to match the configuration. Continue? [y/N]: ",
        )?;
        if !input.eq_ignore_ascii_case("y") {
            eprintln!("Reconciliation cancelled.");
            return Ok(());
        }
    }

    let mut reconciler = reconciler(stack)?;
    if let Some(attempts) = max_attempts {
        reconciler = reconciler.with_max_attempts(attempts);
    }

    let result = reconciler.reconcile().await?;
    println!("{}", formatter.format_reconcile(&result));
    Ok(())
}

/// Show one or all outputs.
async fn cmd_output(cli: &Cli, name: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = reconciler(load_stack(cli).await?)?;
    let outputs = reconciler.outputs().await?;

    match name {
        None => println!("{}", formatter.format_outputs(&outputs)),
        Some(name) => {
            let value = outputs.get(name).ok_or_else(|| {
                ConfigError::validation(format!("unknown output '{name}'"), "outputs")
            })?;
            if formatter.is_json() {
                println!("{value}");
            } else {
                println!("{}", render_scalar(value));
            }
        }
    }
    Ok(())
}

/// State management commands.
async fn cmd_state(cli: &Cli, command: &StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let stack = load_stack(cli).await?;
    let store = stack.store;

    match command {
        StateCommands::List => {
            let records = store.list().await?;
            println!("{}", formatter.format_records(&records));
        }
        StateCommands::Show { address } => {
            let id = parse_address(address)?;
            match store.get(&id).await? {
                Some(record) => println!("{}", formatter.format_record(&record)),
                None => eprintln!("No record for {id}."),
            }
        }
        StateCommands::Rm { address } => {
            let id = parse_address(address)?;
            let lock = store.acquire_lock(&generate_holder_id()).await?;
            let result = store.delete(&id).await;
            store.release_lock(&lock.lock_id).await?;
            result?;
            eprintln!(
                "{}",
                formatter.success(&format!("Removed {id} from state; the resource itself was not destroyed."))
            );
        }
        StateCommands::Lock { holder } => {
            let holder = holder.clone().unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if *force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    warn!("Forcefully releasing lock held by {}", lock_info.holder);
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("{}", formatter.success("State forcefully unlocked."));
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Applies a plan and prints its report, also when steps failed.
async fn run_apply(reconciler: &Reconciler, plan: &Plan, formatter: &OutputFormatter) -> Result<()> {
    let cancel = reconciler.cancellation_token();
    let watcher = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let result = reconciler.apply(plan).await;
    watcher.abort();

    match result {
        Ok(report) => {
            println!("{}", formatter.format_report(&report));
            if report.cancelled {
                eprintln!(
                    "{}",
                    formatter.warning("Run was cancelled; run 'stratum plan' to see what remains.")
                );
            }
            Ok(())
        }
        Err(StratumError::Apply(failed)) => {
            println!("{}", formatter.format_report(&failed.report));
            Err(StratumError::Apply(failed))
        }
        Err(e) => Err(e),
    }
}

/// Cancels the token on Ctrl-C; in-flight steps finish, nothing new starts.
async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nInterrupted, waiting for in-flight steps to finish...");
        cancel.cancel();
    }
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn parse_address(address: &str) -> Result<ResourceId> {
    ResourceId::parse(address)
        .map_err(|e| ConfigError::validation(format!("invalid address '{address}': {e}"), "address").into())
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads `.env` and the stack file with environment overrides applied.
fn load_config(cli: &Cli) -> Result<(PathBuf, StackConfig)> {
    let config_file = resolve_config_path(cli.config.as_ref())?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    Ok((config_file, config))
}

/// Variable overrides: `STRATUM_VAR_*` first, then `--var` flags.
fn variable_overrides(cli: &Cli) -> Result<BTreeMap<String, Value>> {
    let mut overrides = ConfigParser::variable_overrides_from_env();
    for assignment in &cli.vars {
        let (name, value) = parse_assignment(assignment)?;
        overrides.insert(name, value);
    }
    Ok(overrides)
}

/// Loads and validates the configuration and opens its state backend.
async fn load_stack(cli: &Cli) -> Result<Stack> {
    let (config_file, config) = load_config(cli)?;
    ConfigValidator::new().validate(&config)?;

    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || config_dir(&config_file).join(STATE_DIR),
                PathBuf::from,
            );
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 bucket not configured", "state.bucket")
            })?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await?)
        }
        StateBackend::Memory => {
            warn!("Using in-memory state; nothing is kept after this run");
            Arc::new(MemoryStateStore::new())
        }
    };

    let environment = cli
        .env
        .clone()
        .unwrap_or_else(|| config.project.environment.clone());

    Ok(Stack {
        overrides: variable_overrides(cli)?,
        config,
        store,
        environment,
    })
}

/// Builds a reconciler for a loaded stack.
fn reconciler(stack: Stack) -> Result<Reconciler> {
    let provider = Arc::new(ProviderRegistry::from_config(&stack.config)?);
    Ok(Reconciler::new(stack.config, provider, stack.store)
        .with_environment(stack.environment)
        .with_variables(stack.overrides))
}
