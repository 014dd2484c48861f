/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Running connectivity core with periodic health logs and graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use exlink_adapter::{CommandSigner, RequestSigner};
use exlink_core::{ConnectivityCore, CoreConfig};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "exlink-core", version, about = "Exchange connectivity core")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting exlink-core"
    );

    let config = CoreConfig::from_file(&args.config_path).context("load config")?;
    info!(
        rest_url = %config.exchange.rest.rest_url,
        ws_url = %config.exchange.ws.url,
        push_ratio = config.router.push_ratio,
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let signer_config = config
        .signer
        .clone()
        .context("signer must be configured outside dry-run")?;
    let signer: Arc<dyn RequestSigner> = Arc::new(CommandSigner::new(signer_config));

    let core = ConnectivityCore::new(config, signer).context("build connectivity core")?;
    let shutdown = core.shutdown_token();
    setup_signal_handlers(shutdown.clone());

    core.start();

    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => log_health(&core).await,
        }
    }
    info!("shutdown signal received");

    core.shutdown_and_wait()
        .await
        .context("shutdown connectivity core")?;
    info!("connectivity core shutdown complete");

    Ok(())
}

async fn log_health(core: &ConnectivityCore) {
    let health = core.health_report().await;
    match serde_json::to_string(&health) {
        Ok(json) => info!(health = %json, "health"),
        Err(err) => warn!(error = %err, "failed to serialize health report"),
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
