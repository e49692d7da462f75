//! # Cycler Harvest CLI (`harvest`)
//!
//! One binary for both sides: the server commands work against the
//! database named in `--config`, the harvester commands against the
//! settings file named in `--settings`.
//!
//! ## Commands
//!
//! | Command | Side | Description |
//! |---------|------|-------------|
//! | `harvest init` | server | Create the SQLite database and run migrations |
//! | `harvest serve` | server | Start the HTTP server |
//! | `harvest paths add/list` | server | Manage monitored paths |
//! | `harvest files` | server | File states, last errors and per-state counts |
//! | `harvest reimport <id>` | server | Clear a file's data and import it again |
//! | `harvest setup` | harvester | Register with a server and write settings |
//! | `harvest run` | harvester | Run the observation loop |
//! | `harvest inspect <file>` | harvester | Parse a file locally |
//!
//! Diagnostics go to stderr through `env_logger`; set `RUST_LOG=debug` for
//! more detail.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cycler_harvest::{config, files, harvester, inspect, migrate, server};

/// Cycler Harvest: collect battery-cycler files into a central store.
#[derive(Parser)]
#[command(name = "harvest", version)]
struct Cli {
    /// Server configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Harvester settings file written by `harvest setup`.
    #[arg(long, global = true, default_value = "./harvester.toml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and seed the standard catalogue.
    ///
    /// Idempotent: running it again leaves existing data alone.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Manage monitored paths.
    Paths {
        #[command(subcommand)]
        action: PathsAction,
    },

    /// List observed files with their state and last error.
    Files {
        /// Only files of this harvester.
        #[arg(long)]
        harvester: Option<i64>,
    },

    /// Drop a file's stored data and queue it for import again.
    Reimport {
        /// File id as shown by `harvest files`.
        file_id: i64,
    },

    /// Register this machine as a harvester and write the settings file.
    Setup {
        /// Server base URL, e.g. `http://lab-server:8730`.
        #[arg(long)]
        server: String,

        /// Harvester name shown to operators.
        #[arg(long)]
        name: String,
    },

    /// Run the observation loop.
    Run {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Parse a file locally and print what would be uploaded.
    Inspect {
        /// Path to a cycler data file.
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum PathsAction {
    /// Watch a directory for a harvester.
    Add {
        /// Harvester id.
        #[arg(long)]
        harvester: i64,

        /// Directory on the harvester machine.
        path: String,

        /// Glob matched against paths relative to the directory.
        #[arg(long, default_value = "*")]
        pattern: String,

        /// Seconds a file's size must stay unchanged before import.
        /// Defaults to `[server].default_stable_time`.
        #[arg(long)]
        stable_time: Option<u64>,
    },

    /// List monitored paths.
    List {
        /// Only paths of this harvester.
        #[arg(long)]
        harvester: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Harvester-side commands never read the server config.
    match &cli.command {
        Commands::Setup { server, name } => {
            let settings = harvester::setup(server, name, &cli.settings).await?;
            println!(
                "Registered as harvester {} ({}). Settings written to {}",
                settings.harvester_id,
                settings.name,
                cli.settings.display()
            );
            return Ok(());
        }
        Commands::Run { once } => {
            if *once {
                let (summary, _) = harvester::run_once(&cli.settings).await?;
                println!(
                    "Observed {} files: {} imported, {} failed, {} unsupported, {} skipped",
                    summary.observed,
                    summary.imported,
                    summary.failed,
                    summary.unsupported,
                    summary.skipped
                );
            } else {
                harvester::run_forever(&cli.settings).await?;
            }
            return Ok(());
        }
        Commands::Inspect { file } => {
            inspect::run_inspect(file)?;
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Paths { action } => match action {
            PathsAction::Add {
                harvester,
                path,
                pattern,
                stable_time,
            } => {
                files::add_path(&cfg, harvester, &path, &pattern, stable_time).await?;
            }
            PathsAction::List { harvester } => {
                files::list_paths(&cfg, harvester).await?;
            }
        },
        Commands::Files { harvester } => {
            files::list_files(&cfg, harvester).await?;
        }
        Commands::Reimport { file_id } => {
            files::reimport(&cfg, file_id).await?;
        }
        Commands::Setup { .. } | Commands::Run { .. } | Commands::Inspect { .. } => {}
    }

    Ok(())
}
