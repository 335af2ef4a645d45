//! MySQL Kubernetes Operator
//!
//! Manages Raft-coordinated MySQL clusters on Kubernetes.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::CustomResourceExt;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mysql_operator::config::OperatorConfig;
use mysql_operator::controller::Controller;
use mysql_operator::crd::{Backup, MysqlCluster};
use mysql_operator::metrics;

#[derive(Parser, Debug)]
#[command(name = "mysql-operator")]
#[command(about = "Kubernetes Operator for Raft-coordinated MySQL clusters")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, default_value = "")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "9104")]
    metrics_port: u16,

    /// Health check port
    #[arg(short = 'H', long, default_value = "8081")]
    health_port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Operator configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the status controller period
    #[arg(long)]
    status_interval_secs: Option<u64>,

    /// Print the CRDs as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", serde_yaml::to_string(&MysqlCluster::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&Backup::crd())?);
        return Ok(());
    }

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    if let Some(secs) = args.status_interval_secs {
        config.status.interval = Duration::from_secs(secs);
        config.validate()?;
    }

    info!("Starting MySQL Kubernetes Operator");
    info!(namespace = %args.namespace, "Watching namespace");

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port));
    let health_handle = tokio::spawn(run_health_server(args.health_port));

    let controller = std::sync::Arc::new(Controller::new(args.namespace.clone(), config).await?);

    let cluster_handle = {
        let controller = std::sync::Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!(error = %e, "Cluster controller error");
            }
        })
    };

    let status_handle = {
        let controller = std::sync::Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run_status().await {
                error!(error = %e, "Status controller error");
            }
        })
    };

    info!("All controllers started");

    // Wait for any task to complete (usually due to shutdown signal)
    tokio::select! {
        _ = cluster_handle => info!("Cluster controller stopped"),
        _ = status_handle => info!("Status controller stopped"),
        result = metrics_handle => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "Metrics server failed");
            }
        }
        result = health_handle => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "Health server failed");
            }
        }
    }

    Ok(())
}

async fn run_health_server(port: u16) -> std::io::Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Health server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = metrics::http_ok("text/plain", "OK");
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}
