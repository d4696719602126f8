//! instance-init - boot-time instance configuration
//!
//! Resolves the datasource, consumes user-data once per instance and runs
//! the user scripts it provides.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use instance_init::datasources::{Datasource, DatasourceCache, DatasourceRegistry};
use instance_init::state::{CloudPaths, Frequency, InstanceState};
use instance_init::{InitError, run_init};

#[derive(Parser)]
#[command(name = "instance-init")]
#[command(author, version, about = "Boot-time instance configuration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Persistent state directory
    #[arg(long, env = "INSTANCE_INIT_BASE_DIR", default_value = "/var/lib/cloud")]
    base_dir: PathBuf,

    /// System configuration directory
    #[arg(long, env = "INSTANCE_INIT_CONFIG_DIR", default_value = "/etc/cloud")]
    config_dir: PathBuf,

    /// Volatile per-boot directory
    #[arg(long, env = "INSTANCE_INIT_RUN_DIR", default_value = "/run/cloud-init")]
    run_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the datasource and consume user-data
    Init,
    /// Print a value from the cached datasource
    Query {
        /// instance-id, hostname, locale, mirror, public-keys or datasource
        key: String,
    },
    /// Remove persistent state so the next boot starts over
    Clean,
    /// Remove one semaphore so its action runs again
    ClearSemaphore {
        /// Action name, e.g. consume-user-data
        action: String,
        /// always, once-per-instance or once
        #[arg(long, default_value = "once-per-instance")]
        frequency: Frequency,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<(), InitError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = CloudPaths::with_dirs(&cli.base_dir, &cli.config_dir, &cli.run_dir);

    match cli.command.unwrap_or(Commands::Init) {
        Commands::Init => {
            let registry = DatasourceRegistry::builtin(&paths);
            let outcome = run_init(&paths, &registry).await?;
            if let Some(report) = &outcome.dispatch {
                info!(
                    "User-data: {} part(s) dispatched, {} dropped, {} handler failure(s)",
                    report.dispatched,
                    report.dropped,
                    report.failures.len()
                );
            }
            if let Some(report) = &outcome.scripts {
                info!(
                    "User scripts: {} ran, {} failed",
                    report.ran,
                    report.failures()
                );
            }
        }
        Commands::Query { key } => {
            let cached = DatasourceCache::from_paths(&paths)
                .load()
                .await?
                .ok_or_else(|| InitError::Datasource("no cached datasource".to_string()))?;
            let value = match key.as_str() {
                "instance-id" => cached.instance_id().to_string(),
                "hostname" | "local-hostname" => cached.hostname().unwrap_or_default().to_string(),
                "locale" => cached.locale().to_string(),
                "mirror" => cached.local_mirror().to_string(),
                "public-keys" => cached.public_keys().join("\n"),
                "datasource" => cached.name().to_string(),
                other => {
                    return Err(InitError::InvalidData(format!("unknown key: {other}")));
                }
            };
            println!("{value}");
        }
        Commands::Clean => {
            InstanceState::with_paths(paths).clean().await?;
        }
        Commands::ClearSemaphore { action, frequency } => {
            let state = InstanceState::with_paths(paths);
            let instance_id = state.load_instance_id().await?;
            let store = state.semaphores(instance_id.as_deref());
            if store.clear(&action, frequency).await? {
                info!("Cleared semaphore {} ({})", action, frequency);
            } else {
                return Err(InitError::Config(format!(
                    "could not clear semaphore {action} ({frequency})"
                )));
            }
        }
    }

    Ok(())
}
