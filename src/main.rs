//! meshd daemon
//!
//! Runs one mesh node over TCP. On startup it resumes persisted membership,
//! or seeds / joins a mesh when asked to; on Ctrl+C or SIGTERM it stops the
//! node, optionally leaving the mesh first.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use meshd::{
    config::{DaemonConfig, Overrides, StartupAction},
    logging::{self, LogFormat},
    mesh::{
        metrics as mesh_metrics, JoinMeshRequest, JoinStrategy, LeaveMeshRequest, MeshNode,
        SeedMeshRequest, TcpTransport,
    },
};
use tracing as log;

#[derive(Parser, Debug)]
#[command(name = "meshd", version, about = "Mesh membership daemon")]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "MESHD_CONFIG")]
    config: Option<PathBuf>,

    /// Node name
    #[arg(long, env = "MESHD_NAME")]
    name: Option<String>,

    /// Listen address (ip:port)
    #[arg(long, env = "MESHD_LISTEN")]
    listen: Option<String>,

    /// Address peers should dial, when different from the listen address
    #[arg(long, env = "MESHD_ADVERTISE")]
    advertise: Option<String>,

    #[arg(long, env = "MESHD_REGION")]
    region: Option<String>,

    /// Directory for identity and membership state
    #[arg(long, env = "MESHD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seed a new mesh with this name on startup
    #[arg(long, conflicts_with = "join")]
    seed: Option<String>,

    /// Join the mesh through the node at this address on startup
    #[arg(long)]
    join: Option<String>,

    /// Join strategy: inherit, merge or overwrite
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<JoinStrategy>,

    /// Join key for --seed (required of joiners) or --join (presented)
    #[arg(long, env = "MESHD_JOIN_KEY", hide_env_values = true)]
    join_key: Option<String>,

    #[arg(long, env = "MESHD_LOG_LEVEL")]
    log_level: Option<String>,

    /// text or json
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Also write daily rolling log files here
    #[arg(long, env = "MESHD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "MESHD_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Leave the mesh on shutdown instead of keeping membership
    #[arg(long)]
    leave_on_shutdown: bool,
}

fn parse_strategy(s: &str) -> Result<JoinStrategy, String> {
    s.parse()
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            name: self.name.clone(),
            listen: self.listen.clone(),
            advertise: self.advertise.clone(),
            region: self.region.clone(),
            data_dir: self.data_dir.clone(),
            seed: self.seed.clone(),
            join: self.join.clone(),
            strategy: self.strategy,
            join_key: self.join_key.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
            log_dir: self.log_dir.clone(),
            metrics_addr: self.metrics_addr.clone(),
            leave_on_shutdown: self.leave_on_shutdown,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref(), args.overrides())?;
    let _log_guard = logging::init(&config.logging)?;

    log::info!("meshd v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = &config.metrics_addr {
        let addr: std::net::SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid metrics address '{addr}'"))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        log::info!("Serving metrics on http://{}/metrics", addr);
    }
    mesh_metrics::describe();

    let node = MeshNode::start(config.node.clone(), Arc::new(TcpTransport::new()))
        .await
        .context("failed to start mesh node")?;
    run_startup_action(&node, &config.startup).await?;

    log::info!(
        "Node {} ready on {} ({}). Press Ctrl+C to stop.",
        node.node_id(),
        node.local_addr(),
        node.status()
    );
    shutdown_signal().await;
    log::info!("Shutdown signal received");

    if config.leave_on_shutdown && node.status().is_member() {
        match node.leave_mesh(LeaveMeshRequest { force: true }).await {
            Ok(left) => log::info!(
                "Left mesh {} ({} connection(s) dropped)",
                left.mesh_id,
                left.connections_dropped
            ),
            Err(e) => log::warn!("Leaving the mesh failed: {}", e),
        }
    }
    node.shutdown().await;
    log::info!("Daemon stopped");
    Ok(())
}

async fn run_startup_action(node: &MeshNode, action: &StartupAction) -> anyhow::Result<()> {
    match action {
        StartupAction::Resume => {
            if let Some(mesh_id) = node.mesh_id() {
                log::info!("Resuming membership in mesh {}", mesh_id);
            }
        }
        StartupAction::Seed {
            mesh_name,
            join_key,
        } => {
            if node.status().is_member() {
                log::info!("Already a mesh member; ignoring --seed");
                return Ok(());
            }
            let mut req = SeedMeshRequest::new(mesh_name.clone());
            req.join_key = join_key.clone();
            let seeded = node.seed_mesh(req).await.context("seeding the mesh failed")?;
            log::info!("Seeded mesh {}", seeded.mesh.mesh_id);
        }
        StartupAction::Join {
            target_address,
            strategy,
            join_key,
        } => {
            if node.status().is_member() {
                log::info!("Already a mesh member; ignoring --join");
                return Ok(());
            }
            let mut req = JoinMeshRequest::new(target_address.clone());
            req.strategy = *strategy;
            req.join_key = join_key.clone();
            let joined = node
                .join_mesh(req)
                .await
                .with_context(|| format!("joining through {target_address} failed"))?;
            log::info!("Joined through node {}", joined.sponsor_node_id);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            _ => log::warn!("Cannot install signal handlers; falling back to Ctrl+C"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {}", e);
    }
}
