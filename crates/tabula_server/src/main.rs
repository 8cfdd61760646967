use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tabula_balancer::BalancerRunner;
use tabula_cluster::{tablet_balancer, Cluster};
use tabula_common::config::TabulaConfig;
use tabula_hydra::{Supervisor, SupervisorConfig};

mod status;

use status::StatusState;

#[derive(Parser, Debug)]
#[command(name = "tabula", about = "Tabula: replicated dynamic tables and journals")]
struct Cli {
    /// Config file path. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Status HTTP listen address, e.g. 127.0.0.1:8080.
    #[arg(long)]
    status_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        print!("{}", toml::to_string_pretty(&TabulaConfig::default())?);
        return Ok(());
    }

    tabula_observability::init_tracing();

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading config from {}", path.display());
            TabulaConfig::load_from_file(path)?
        }
        None => {
            tracing::info!("No config file given, using defaults");
            TabulaConfig::default()
        }
    };

    if !config.observability.metrics_listen_addr.is_empty() {
        if let Err(e) = tabula_observability::init_metrics(&config.observability.metrics_listen_addr) {
            tracing::warn!("Failed to start metrics exporter: {}", e);
        }
    }

    let supervisor_interval = Duration::from_millis(config.tablet_manager.supervisor_interval_ms);
    tracing::info!(
        nodes = config.cluster.node_count,
        cells = config.cluster.cell_count,
        "Starting cluster"
    );
    let cluster = Arc::new(Cluster::new(config)?);

    let supervisor = Supervisor::start(
        SupervisorConfig {
            name: "tabula-supervisor".to_string(),
            interval: supervisor_interval,
        },
        cluster.clone(),
    )?;

    let balancer = Arc::new(tablet_balancer(&cluster));
    let balancer_runner = BalancerRunner::start(balancer.clone())?;

    let status_state = Arc::new(StatusState::new(cluster.clone(), balancer.clone()));
    let (status_stop_tx, mut status_stop_rx) = tokio::sync::watch::channel(false);
    let status_task = cli.status_addr.clone().map(|addr| {
        let state = status_state.clone();
        tokio::spawn(async move {
            status::run_status_server(&addr, state, async move {
                let _ = status_stop_rx.changed().await;
            })
            .await;
        })
    });

    tracing::info!("Tabula ready");
    let reason = wait_for_shutdown_signal().await;
    tracing::info!("{}, shutting down", reason);
    status_state.set_ready(false);

    // Both handles join OS threads.
    tokio::task::spawn_blocking(move || {
        balancer_runner.stop_and_join();
        supervisor.stop_and_join();
    })
    .await?;

    let _ = status_stop_tx.send(true);
    if let Some(task) = status_task {
        let _ = task.await;
    }

    tracing::info!("Tabula stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT (Ctrl+C) received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}
