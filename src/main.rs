//! supastack - brings the standard platform up and tears it down on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

use supastack::{
    Config, ConfigParams, EncryptionKeySource, Orchestrator, PartialFailurePolicy, catalog,
    logging,
};

#[derive(Parser, Debug)]
#[command(name = "supastack")]
#[command(about = "Run a self-hosted Supabase-style platform on the local container engine")]
#[command(version)]
struct Args {
    /// Platform name used to namespace the network and containers
    #[arg(long)]
    platform: Option<String>,

    /// Remove existing containers with the same names before creating
    #[arg(long)]
    force: bool,

    /// Keep containers after shutdown and stream their output
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Encryption key file (created with a random key if absent)
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Tear everything down if any service fails to come up
    #[arg(long)]
    stop_all_on_failure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let dispatch = logging::opinionated(args.log_level, args.json_logs);
    tracing::dispatcher::set_global_default(dispatch.clone())?;

    let mut params = ConfigParams::from_env()?;
    if let Some(platform) = args.platform {
        params.platform_name = Some(platform);
    }
    if args.debug {
        params.debug_mode = Some(true);
    }
    if let Some(path) = args.key_file {
        params.encryption_key = Some(EncryptionKeySource::File(path));
    }
    let config = Arc::new(Config::new(params)?);
    tracing::info!(platform = %config.global.platform_name, "Loaded configuration");

    let policy = if args.stop_all_on_failure {
        PartialFailurePolicy::StopAll
    } else {
        PartialFailurePolicy::LeaveRunning
    };
    let orchestrator = Orchestrator::connect(Arc::clone(&config), dispatch)
        .await?
        .with_partial_failure_policy(policy);
    orchestrator.add_services(catalog::all(&config)?).await;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            cancel.cancel();
        });
    }

    let result = if args.force {
        orchestrator.run_forcefully(&cancel).await
    } else {
        orchestrator.run(&cancel).await
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Platform failed to start");
        orchestrator.stop().await;
        return Err(e.into());
    }

    for status in orchestrator.services().await {
        tracing::info!(service = %status.name, state = %status.state, "Service status");
    }
    tracing::info!("Platform is up, press Ctrl-C to stop");

    cancel.cancelled().await;
    orchestrator.stop().await;
    tracing::info!("Platform stopped");
    Ok(())
}
