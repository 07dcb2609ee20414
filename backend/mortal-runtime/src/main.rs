use anyhow::Result;
use clap::Parser;
use mortal_runtime::{build_runtime, run_forever, Settings};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Entry point for the mortal agent runtime: an economically-mortal
/// autonomous agent that pays for its own LLM calls and services out of
/// an on-chain vault, and dies when the balance runs out.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (without extension; `.toml`/`.json`/`.yaml` all resolve)
    #[arg(short, long, default_value = "config")]
    config: String,

    /// Override the data directory from the config file
    #[arg(long)]
    data_dir: Option<String>,

    /// Override the log level from the config file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::load(&args.config)?;
    if let Some(dir) = args.data_dir {
        settings.data_dir = dir.into();
    }
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }

    init_tracing(&settings.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting mortal-runtime");

    let runtime = build_runtime(&settings).await?;
    info!(
        balance = runtime.vault.balance().await,
        creator = %settings.creator_address,
        "runtime constructed, entering heartbeat loop"
    );

    let interval = Duration::from_secs(settings.heartbeat_interval_secs);
    let result = tokio::select! {
        r = run_forever(&runtime, interval, Vec::new) => r,
        _ = shutdown_signal() => {
            info!("shutdown signal received, persisting state and exiting");
            mortal_runtime::persist_vault_snapshot(&runtime.vault, &settings.data_dir).await?;
            Ok(())
        }
    };

    match result {
        Ok(()) => {
            info!("mortal-runtime shut down cleanly");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "mortal-runtime exiting on fatal error");
            Err(e)
        }
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("mortal_runtime={level}").into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
