mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "simflow",
    about = "Automated submission and tracking of HPC simulation workflows",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workflow root (default: auto-detect from .simflow/)
    #[arg(long, global = true, env = "SIMFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log at debug level
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    /// Also append logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize simflow in the current directory
    Init,

    /// Create task rows for one or more realisations
    Install {
        /// Realisation names, e.g. Hossack_REL01
        #[arg(required = true)]
        runs: Vec<String>,

        /// Comma-separated stages to install (default: all)
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,
    },

    /// Run the auto-submit loop
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Exit once nothing is active and nothing more can be submitted
        #[arg(long)]
        until_idle: bool,

        /// Exit after this many submissions
        #[arg(long, value_name = "N")]
        max_submissions: Option<usize>,
    },

    /// Apply pending mailbox updates to the task store
    Reconcile,

    /// Post a manual status update for a task
    Update {
        run: String,
        stage: String,
        status: String,

        /// Scheduler job id (required for queued)
        #[arg(long)]
        job_id: Option<u64>,

        /// Error text to record with the update
        #[arg(long)]
        error: Option<String>,
    },

    /// Cancel a task's job and mark it killed
    Cancel { run: String, stage: String },

    /// Show pipeline progress
    Status {
        /// Only this realisation
        #[arg(long)]
        run: Option<String>,

        /// Only this stage
        #[arg(long)]
        stage: Option<String>,

        /// With --stage: SQL-LIKE pattern over run names (e.g. Hossack%)
        #[arg(long, requires = "stage")]
        pattern: Option<String>,
    },

    /// Show the applied transitions of a task
    History { run: String, stage: String },

    /// Show the scheduler's current queue
    Queue,

    /// Inspect and validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn init_tracing(default_level: tracing::Level, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into());

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("cannot open log file {}: {e}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => tracing::Level::DEBUG,
        (Commands::Run { .. }, false) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    if let Err(e) = init_tracing(default_level, cli.log_file.as_ref()) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Install { runs, stages } => cmd::install::run(&root, &runs, &stages, cli.json),
        Commands::Run {
            once,
            until_idle,
            max_submissions,
        } => cmd::run::run(&root, once, until_idle, max_submissions, cli.json),
        Commands::Reconcile => cmd::reconcile::run(&root, cli.json),
        Commands::Update {
            run,
            stage,
            status,
            job_id,
            error,
        } => cmd::update::run(&root, &run, &stage, &status, job_id, error, cli.json),
        Commands::Cancel { run, stage } => cmd::cancel::run(&root, &run, &stage, cli.json),
        Commands::Status {
            run,
            stage,
            pattern,
        } => cmd::status::run(
            &root,
            run.as_deref(),
            stage.as_deref(),
            pattern.as_deref(),
            cli.json,
        ),
        Commands::History { run, stage } => cmd::history::run(&root, &run, &stage, cli.json),
        Commands::Queue => cmd::queue::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
