//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use converge::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use converge::config::{StackValidator, find_stack_file};
use converge::engine::{Engine, load_stack};
use converge::error::Result;
use converge::graph::GraphBuilder;
use converge::planner::Plan;

use clap::Parser;
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
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns whether the command fully succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, concurrency, strict_compliance } => {
            cmd_apply(config, yes, concurrency, strict_compliance, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<bool> {
    info!("Initializing new stack in: {}", path.display());

    let stack_path = path.join("converge.stack.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && stack_path.exists() {
        eprintln!("Stack file already exists: {}", stack_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(false);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let template = include_str!("../templates/converge.stack.yaml");
    std::fs::write(&stack_path, template)?;
    eprintln!("Created: {}", stack_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".converge/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.converge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit converge.stack.yaml to declare your resources");
    eprintln!("  2. Run 'converge validate' to check the stack");
    eprintln!("  3. Run 'converge plan' to see what will change");
    eprintln!("  4. Run 'converge apply' to converge");

    Ok(true)
}

/// Validate the stack file and its graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool) -> Result<bool> {
    let stack_file = resolve_stack_path(config_path)?;
    info!("Validating stack: {}", stack_file.display());

    let parser = converge::config::StackParser::new().with_base_path(
        stack_file.parent().unwrap_or_else(|| Path::new(".")),
    );
    parser.load_dotenv()?;
    let config = parser.load_with_env(&stack_file)?;

    let result = StackValidator::new().check(&config);
    if !result.is_valid() {
        eprintln!("Stack is invalid ({} errors):", result.error_count());
        for error in &result.errors {
            eprintln!("  - {error}");
        }
        return Ok(false);
    }

    let graph = GraphBuilder::new().build_stack(&config)?;
    eprintln!("Stack is valid!");

    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nStack summary:");
    eprintln!("  Project: {}", config.project.name);
    eprintln!("  Environment: {}", config.project.environment);
    eprintln!("  Resources: {}", graph.len());
    eprintln!("  Outputs: {}", config.outputs.len());
    eprintln!(
        "  Controls: {}",
        config.compliance.as_ref().map_or(0, |c| c.controls.len())
    );

    Ok(true)
}

/// Print the resource graph in apply order.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<bool> {
    let config = load_stack(&resolve_stack_path(config_path)?)?;
    let graph = GraphBuilder::new().build_stack(&config)?;
    emit(formatter, &formatter.format_graph(&graph))?;
    Ok(true)
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let engine = load_engine(config_path).await?;
    let plan = engine.plan().await?;
    emit(formatter, &formatter.format_plan(&plan, detailed))?;
    Ok(true)
}

/// Apply the stack.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    strict_compliance: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let mut engine = load_engine(config_path).await?;
    if let Some(concurrency) = concurrency {
        engine = engine.with_concurrency(concurrency);
    }

    let approve = |plan: &Plan| -> Result<bool> {
        if plan.is_empty() {
            eprintln!("No changes to apply.");
            return Ok(true);
        }
        if formatter.is_json() && auto_approve {
            return Ok(true);
        }
        eprintln!("{}", formatter.format_plan(plan, false));
        if auto_approve {
            return Ok(true);
        }
        confirm("Do you want to apply this plan? [y/N]: ", |input| {
            input.eq_ignore_ascii_case("y")
        })
    };

    let Some(summary) = engine.apply(interrupt_token(), approve).await? else {
        eprintln!("Apply cancelled.");
        return Ok(true);
    };

    emit(formatter, &formatter.format_summary(&summary))?;

    if summary.compliance_failed() {
        if strict_compliance {
            return Ok(false);
        }
        warn!("Compliance controls failed; pass --strict-compliance to fail the run");
    }
    Ok(summary.success())
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let engine = load_engine(config_path).await?;

    let approve = |plan: &Plan| -> Result<bool> {
        if plan.is_empty() {
            eprintln!("No resources to destroy.");
            return Ok(false);
        }

        eprintln!("The following resources will be destroyed:");
        for op in &plan.operations {
            eprintln!(
                "  - {} ({})",
                op.id,
                op.physical_id.as_deref().unwrap_or("unknown")
            );
        }

        if auto_approve {
            return Ok(true);
        }
        confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            |input| input == "destroy",
        )
    };

    let Some(summary) = engine.destroy(interrupt_token(), approve).await? else {
        return Ok(true);
    };

    emit(formatter, &formatter.format_summary(&summary))?;
    Ok(summary.success())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let engine = load_engine(config_path).await?;

    match command {
        StateCommands::Show => {
            if let Some(lock) = engine.lock_info().await? {
                eprintln!(
                    "Locked by {} ({}, run {}) since {}",
                    lock.holder, lock.lock_id, lock.run_id, lock.acquired_at
                );
            }
            if engine.store().exists().await? {
                let state = engine.current_state().await?;
                emit(formatter, &formatter.format_state(&state))?;
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::List => {
            let state = engine.current_state().await?;
            emit(formatter, &formatter.format_records(&state))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if !force && lock_id.is_none() {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(false);
            }
            if engine.unlock(lock_id.as_deref(), force).await? {
                eprintln!("State unlocked.");
            } else {
                eprintln!("State was not locked.");
            }
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_stack_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_stack_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the stack and wires up its engine.
async fn load_engine(config_path: Option<&Path>) -> Result<Engine> {
    let stack_file = resolve_stack_path(config_path)?;
    debug!("Loading stack from: {}", stack_file.display());
    Engine::from_file(&stack_file).await
}

/// Returns a token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight operations");
            trigger.cancel();
        }
    });
    token
}

/// Prompts on stderr and checks the answer.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(accept(input.trim()))
}

/// Writes command output: JSON to stdout for scripting, text to stderr.
fn emit(formatter: &OutputFormatter, output: &str) -> Result<()> {
    if formatter.is_json() {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{output}")?;
    } else {
        eprintln!("{output}");
    }
    Ok(())
}
