use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use parley_relay::{
    cli::{self, Cli, Commands},
    config::Config,
    relay::{spawn_stats_reporter, Relay},
    telemetry::{self, LogConfig},
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = telemetry::init(&log_config) {
        eprintln!("failed to initialise logging: {err}");
        std::process::exit(1);
    }

    if let Some(Commands::Probe { url, user, command }) = cli.command {
        if let Err(e) = cli::run_probe(url, user, command).await {
            error!("probe error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    if let Err(e) = run_server(config).await {
        error!("relay error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_server(config: Config) -> Result<()> {
    let relay = Relay::new();
    let reporter = spawn_stats_reporter(relay.clone(), config.stats_interval());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "parley relay listening");

    parley_relay::serve(listener, relay, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await
    .context("server error")?;

    reporter.abort();
    info!("parley relay stopped");
    Ok(())
}
