use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use ingest_pipeline::ingest::archiver::ZipArchiver;
use ingest_pipeline::storage::Ledger;
use ingest_pipeline::utils::logging::init_tracing;
use ingest_pipeline::{build_coordinator, Config};

/// Exit status when the run ended with tasks still unfinished.
const EXIT_INCOMPLETE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ingest", version, about = "Ingest files and folders into the repository")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE", global = true, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or resume the ingest
    Run {
        /// Trigger the archival rule after metadata is attached
        #[arg(long)]
        to_archive_tier: bool,

        /// Also write JSON logs to this file
        #[arg(long, value_name = "FILE")]
        log_json: Option<PathBuf>,
    },
    /// Print the task counts recorded in the ledger
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            to_archive_tier,
            log_json,
        } => {
            config.send_to_archive_tier |= to_archive_tier;
            init_tracing(log_json.or_else(|| config.log_file.clone()).as_deref())?;
            run(config).await
        }
        Commands::Status => {
            init_tracing(None)?;
            let ledger = Ledger::load(&config.ledger_path)
                .with_context(|| format!("cannot read ledger {}", config.ledger_path.display()))?;
            println!("{}", ledger.summary(config.send_to_archive_tier));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    info!("Starting ingest v{}", env!("CARGO_PKG_VERSION"));
    info!("CPU cores available: {}", num_cpus::get());

    let version = ZipArchiver::new(&config.archiver)
        .check_archiver()
        .await
        .context("archiver is not available")?;
    info!("Using {}", version);

    let coordinator = build_coordinator(config);
    let cancel = coordinator.cancel_flag();
    let budget = coordinator.budget();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.store(true, Ordering::SeqCst);
        budget.wake_all();
    });

    let summary = coordinator.run().await.context("ingest run failed")?;
    println!("{summary}");

    if summary.incomplete > 0 {
        warn!("{} tasks are not finished; rerun to resume", summary.incomplete);
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, finishing current items");
}
