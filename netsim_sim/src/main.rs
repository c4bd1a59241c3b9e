//! netsim CLI
//!
//! Imports a simulation template, runs every worker role in-process, launches
//! one run and prints its final state as JSON.

use anyhow::Context;
use clap::Parser;
use netsim_core::model::NewSimulation;
use netsim_core::notify::ReqwestWebhookClient;
use netsim_core::routing::{RoadNetwork, Router, RoutingError};
use netsim_core::storage::{SledStorage, Storage};
use netsim_core::subscription::GeoPoint;
use netsim_env::{LocalBroker, TokioContext};
use netsim_sim::{Engine, EngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netsim")]
#[command(about = "Run a network simulation and deliver its subscription events", long_about = None)]
struct Args {
    /// Simulation template (JSON)
    #[arg(short, long)]
    simulation: PathBuf,

    /// Road network (JSON nodes/edges) for device-location children
    #[arg(short, long)]
    road_network: Option<PathBuf>,

    /// Sled database directory (temporary when omitted)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Stop the run after this many seconds
    #[arg(long)]
    stop_after: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Stand-in when no road network was given; location children end at once.
struct NoRoadNetwork;

impl Router for NoRoadNetwork {
    fn route(&self, _waypoints: &[GeoPoint]) -> Result<Vec<GeoPoint>, RoutingError> {
        Err(RoutingError::Load("no road network configured".into()))
    }
}

fn open_storage(config: &EngineConfig) -> anyhow::Result<Arc<dyn Storage>> {
    let storage = match &config.storage_path {
        Some(path) => SledStorage::open(path)
            .with_context(|| format!("opening storage at {}", path.display()))?,
        None => SledStorage::open_temp().context("opening temporary storage")?,
    };
    Ok(Arc::new(storage))
}

fn load_router(config: &EngineConfig) -> anyhow::Result<Arc<dyn Router>> {
    match &config.road_network_path {
        Some(path) => {
            let network = RoadNetwork::load(path)?;
            info!("Loaded road network with {} nodes", network.node_count());
            Ok(Arc::new(network))
        }
        None => {
            warn!("No road network given, device-location children cannot be routed");
            Ok(Arc::new(NoRoadNetwork))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig {
        storage_path: args.storage.clone(),
        road_network_path: args.road_network.clone(),
        ..Default::default()
    };

    let raw = std::fs::read_to_string(&args.simulation)
        .with_context(|| format!("reading {}", args.simulation.display()))?;
    let template: NewSimulation =
        serde_json::from_str(&raw).context("parsing simulation template")?;

    let storage = open_storage(&config)?;
    let router = load_router(&config)?;
    let broker = LocalBroker::with_topology()
        .await
        .context("declaring broker topology")?;
    let client = Arc::new(ReqwestWebhookClient::new(config.webhook_timeout)?);

    let simulation = storage.insert_simulation(template)?;
    info!("Imported simulation {} ({})", simulation.id, simulation.name);

    let engine = Engine::start(
        TokioContext::shared(),
        broker,
        storage,
        router,
        client,
        &config,
    );
    let (run, children) = engine.launcher().start_simulation(simulation.id).await?;
    info!("Run {} started with {} child simulation(s)", run.id, children.len());

    let stop_after = async {
        match args.stop_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    let stop_requested = tokio::select! {
        finished = engine.wait_for_run(run.id) => {
            finished?;
            false
        }
        _ = stop_after => {
            info!("Stop deadline reached");
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            true
        }
    };
    if stop_requested {
        let stopped = engine.launcher().stop_simulation(simulation.id).await?;
        info!("Sent STOP to {} child simulation(s)", stopped);
        engine.wait_for_run(run.id).await?;
    }

    let summary = engine.summary(run.id)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    engine.shutdown().await;
    Ok(())
}
