//! blobsync-sim - replication scenarios between simulated server processes

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use blobsync_engine::SyncConfig;
use blobsync_logging::{LogConfig, SyncSubscriberBuilder};
use blobsync_simulation::{ClusterOptions, ScenarioReport, run_churn, run_contention, run_handoff};

#[derive(Parser)]
#[command(
    name = "blobsync-sim",
    about = "State replication scenarios between simulated server processes",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for the shared database (temporary when omitted)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine configuration file, created with defaults when missing
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pass one entity around the servers, leaving and joining each time
    Handoff {
        /// Number of handoffs
        #[arg(long, default_value = "4")]
        hops: usize,

        /// Number of servers (max 26)
        #[arg(short, long, default_value = "3")]
        servers: usize,
    },

    /// Servers take turns writing one entity while others hold drafts
    Contention {
        /// Number of write rounds
        #[arg(short, long, default_value = "10")]
        rounds: usize,

        /// Number of servers (max 26)
        #[arg(short, long, default_value = "2")]
        servers: usize,
    },

    /// Attach and detach many entities in batches
    Churn {
        /// Number of batches
        #[arg(short, long, default_value = "5")]
        batches: usize,

        /// Entities per batch
        #[arg(short, long, default_value = "20")]
        per_batch: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::development()
    } else {
        LogConfig::summary()
    };
    let _guard = SyncSubscriberBuilder::new().with_config(log_config).init();

    let defaults = ClusterOptions::default();
    let sync = match &cli.config {
        Some(path) => SyncConfig::load_or_create(path)?,
        None => defaults.sync.clone(),
    };
    sync.validate()?;
    let options = defaults.with_sync(sync).with_data_dir(cli.data_dir);

    // Drives the owning thread of every server; each engine runs its own
    // pool of `io_workers` threads for store and bus I/O
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let report: ScenarioReport = runtime.block_on(async {
        match cli.command {
            Commands::Handoff { hops, servers } => {
                run_handoff(options.with_servers(servers), hops).await
            }
            Commands::Contention { rounds, servers } => {
                run_contention(options.with_servers(servers), rounds).await
            }
            Commands::Churn { batches, per_batch } => {
                run_churn(options, batches, per_batch).await
            }
        }
    })?;

    println!("{report}");
    anyhow::ensure!(report.converged, "scenario {} did not converge", report.scenario);
    Ok(())
}
