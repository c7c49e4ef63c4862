mod commands;
mod logging;
mod preflight;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "millrace",
    version,
    about = "Content-addressed, resumable shell-script pipeline engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline directory (metadata database and object store)
    #[arg(long, default_value = "./millrace-db", global = true)]
    db: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline described by a manifest
    Run {
        /// Path to the manifest YAML file
        #[arg(long)]
        manifest: PathBuf,

        /// Fallback parallelism for steps without their own cap
        #[arg(long)]
        parallel: Option<usize>,

        /// Re-run from this step: its tasks are reset to unprocessed
        #[arg(long)]
        start: Option<String>,

        /// Restrict the run to these steps (repeatable)
        #[arg(long = "step")]
        steps: Vec<String>,

        /// Output sink implementation (auto, fuse, spool)
        #[arg(long, default_value = "auto")]
        sink: String,
    },
    /// Re-queue tasks of superseded step versions onto the current ones
    MigrateTainted {
        /// Manifest to register first, so the target versions exist
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Inspect stored artifacts
    Export {
        /// List resources of this logical name
        #[arg(long, conflicts_with = "hash")]
        name: Option<String>,

        /// Write the blob with this hash to stdout
        #[arg(long)]
        hash: Option<String>,
    },
    /// Delete every task of a step so a later run redoes it
    Undo {
        /// Step name (current version)
        #[arg(long)]
        step: String,
    },
    /// Show pipeline progress
    Status {
        /// Detail one step: task progress and inputs awaiting scheduling
        #[arg(long)]
        step: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            manifest,
            parallel,
            start,
            steps,
            sink,
        } => commands::run::execute(&cli.db, &manifest, parallel, start, steps, &sink).await,
        Commands::MigrateTainted { manifest } => {
            commands::migrate::execute(&cli.db, manifest.as_deref())
        }
        Commands::Export { name, hash } => commands::export::execute(&cli.db, name, hash),
        Commands::Undo { step } => commands::undo::execute(&cli.db, &step),
        Commands::Status { step } => commands::status::execute(&cli.db, step.as_deref()),
    }
}
