use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use knamespacer_controller::{run_controller, ControllerOptions, DEFAULT_QUEUE_CAP};
use knamespacer_core::ConfigResolver;
use knamespacer_kubehub::{get_kube_client, KubeGateway, DEFAULT_WATCH_TIMEOUT_SECS};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "knamespacer", version, about = "Keep namespace annotations and labels in line with a policy file")]
struct Cli {
    /// Path to the namespace policy file (YAML)
    #[arg(short = 'c', long = "config", env = "KNAMESPACER_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Capacity of the reconcile queue
    #[arg(long = "queue-cap", env = "KNAMESPACER_QUEUE_CAP", default_value_t = DEFAULT_QUEUE_CAP)]
    queue_cap: usize,

    /// Seconds a single watch session runs before resubscribing
    #[arg(long = "watch-timeout", env = "KNAMESPACER_WATCH_TIMEOUT_SECS", default_value_t = DEFAULT_WATCH_TIMEOUT_SECS)]
    watch_timeout: u32,
}

fn init_tracing(debug: bool) {
    let env = if debug {
        "debug".to_string()
    } else {
        std::env::var("KNAMESPACER_LOG").unwrap_or_else(|_| "info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KNAMESPACER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KNAMESPACER_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "unable to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics();

    let resolver = ConfigResolver::load(&cli.config)
        .with_context(|| format!("loading namespace policy from {}", cli.config.display()))?;
    info!(
        config = %cli.config.display(),
        namespaces = resolver.policies().namespaces.len(),
        "policy loaded"
    );

    let client = get_kube_client().await?;
    let gateway = KubeGateway::new(client).with_watch_timeout(cli.watch_timeout);

    run_controller(
        Arc::new(gateway),
        Arc::new(resolver),
        ControllerOptions { queue_cap: cli.queue_cap },
        shutdown_signal(),
    )
    .await;
    Ok(())
}
