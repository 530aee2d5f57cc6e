use std::path::PathBuf;

use anicord_sync::{LogFormat, LogSettings, SyncConfig};
use anicord_web::{AppState, LinkHandshake};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "anicord")]
#[command(about = "Discord linked roles backed by AniList statistics")]
struct Cli {
    /// Path to the YAML config file (defaults to $ANICORD_CONFIG, then config.yml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the linking server and the periodic sync.
    Serve,
    /// Sync every linked account once and exit.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Declare the role connection metadata fields on Discord.
    RegisterMetadata,
}

fn init_tracing(log: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .with_context(|| format!("invalid log level {:?}", log.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|err| anyhow!("initialising tracing: {err}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn serve(config: SyncConfig) -> Result<()> {
    let services = anicord_sync::bootstrap(&config).await?;
    anicord_sync::register_application_metadata(&services).await?;

    let scheduler = anicord_sync::maybe_build_scheduler(&config, services.engine.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync.cron, "sync scheduler started");
    }

    let handshake = LinkHandshake::from_services(&services, &config);
    anicord_web::serve(
        &config.server.listen_addr,
        AppState::new(handshake),
        shutdown_signal(),
    )
    .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    info!("shut down cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync => {
            let summary = anicord_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} total={} synced={} removed={} failed={}",
                summary.run_id, summary.total, summary.synced, summary.removed, summary.failed
            );
        }
        Commands::Migrate => {
            anicord_sync::open_user_repository(&config.database).await?;
            println!("migrations applied");
        }
        Commands::RegisterMetadata => {
            let services = anicord_sync::bootstrap(&config).await?;
            anicord_sync::register_application_metadata(&services).await?;
            println!("role connection metadata registered");
        }
    }

    Ok(())
}
