mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use cloyster_core::install_signal_handler;
use cloyster_schema::DEFAULT_SETTINGS_PATH;
use commands::{error_exit_code, Context};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cloyster",
    version,
    about = "Idempotent provisioning orchestrator for HPC head nodes"
)]
struct Cli {
    /// State directory holding run logs and the run lock.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Path to the settings file.
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH, global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply a plan to this host, rolling back on failure.
    Run {
        /// Path to the plan TOML file.
        plan: PathBuf,
        /// Treat a step as already satisfied (repeatable).
        #[arg(long = "skip", value_name = "STEP")]
        skip: Vec<String>,
        /// Only show what would be done.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Show the execution order and what each step would change.
    Plan {
        /// Path to the plan TOML file.
        plan: PathBuf,
    },
    /// Roll back the steps a recorded run left applied.
    Rollback {
        /// Run ID (defaults to the most recent run).
        run_id: Option<String>,
    },
    /// List recorded runs, or show one run in detail.
    Log {
        /// Run ID to show.
        run_id: Option<String>,
    },
    /// Run diagnostic checks on the host and state directory.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CLOYSTER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let json_output = cli.json;
    let context = || Context::load(&cli.config, cli.state_dir.as_deref(), json_output);
    let result = match cli.command {
        Commands::Run {
            plan,
            skip,
            dry_run,
        } => context().and_then(|ctx| commands::run::run(&ctx, &plan, &skip, dry_run)),
        Commands::Plan { plan } => context().and_then(|ctx| commands::plan::run(&ctx, &plan)),
        Commands::Rollback { run_id } => {
            context().and_then(|ctx| commands::rollback::run(&ctx, run_id.as_deref()))
        }
        Commands::Log { run_id } => {
            context().and_then(|ctx| commands::log::run(&ctx, run_id.as_deref()))
        }
        Commands::Doctor => context().and_then(|ctx| commands::doctor::run(&ctx)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(error_exit_code(&msg))
        }
    }
}
