//! depot-agent: keeps this device in sync with the distribution server.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depot_agent::{Agent, AgentConfig, Args, HttpTransport, Identity, NativeStorage};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,depot_agent=debug"
    } else {
        "info,depot_agent=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::try_from(args).context("Invalid configuration")?;

    info!("Starting depot-agent");
    info!("Server: {}", config.server_url);
    info!("Storage directory: {:?}", config.storage_dir);

    let identity = Identity::resolve(&config);
    let storage = NativeStorage::open(&config.storage_dir, config.storage_quota)
        .await
        .context("Failed to open storage directory")?;
    let transport = HttpTransport::new(config.reconnect.connect_timeout)?;

    let agent = Agent::new(config, identity)
        .spawn(storage, transport)
        .await
        .context("Failed to start agent")?;

    info!("Agent running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received, resetting reconnection");
                    agent.reset_reconnect().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
    }

    info!("Shutting down");
    agent.shutdown().await;
    Ok(())
}
