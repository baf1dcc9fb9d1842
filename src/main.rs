use bt_presence_coordinator::cluster::{Cluster, ClusterMessage, MemoryCluster, MqttCluster};
use bt_presence_coordinator::config::{self, ClusterMode, Config};
use bt_presence_coordinator::coordinator::Coordinator;
use bt_presence_coordinator::entities::EntityRegistry;
use bt_presence_coordinator::radio::{MeasurementPipeline, ShellRunner};
use clap::Parser;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bt-presence-coordinator")]
#[command(about = "Cluster-wide Bluetooth Classic presence detection")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the instance name used in the cluster
    #[arg(long)]
    instance_name: Option<String>,

    /// Run as a single node without a broker
    #[arg(long)]
    standalone: bool,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    config::load_dotenv(Path::new(".env"));
    init_logger();
    let cli = Cli::parse();

    info!("Starting Bluetooth presence coordinator");

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(name) = cli.instance_name {
        config.instance_name = name;
    }
    if cli.standalone {
        config.cluster.mode = ClusterMode::Standalone;
    }
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Configuration loaded:");
    info!("  Instance: {}", config.instance_name);
    info!("  Addresses: {}", config.bluetooth.addresses.join(", "));
    info!("  Adapter: hci{}", config.bluetooth.hci_device_id);
    info!("  Interval: {}s", config.bluetooth.interval);
    info!("  Cluster mode: {}", config.cluster.mode);

    let pipeline = MeasurementPipeline::new(
        Arc::new(ShellRunner),
        config.bluetooth.hci_device_id,
        config.bluetooth.query_timeout_duration(),
    );
    if let Err(e) = pipeline.check_capability().await {
        error!("{}", e);
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    let (cluster, inbox): (Arc<dyn Cluster>, mpsc::Receiver<ClusterMessage>) =
        match config.cluster.mode {
            ClusterMode::Standalone => {
                let (cluster, inbox) = MemoryCluster::standalone(config.instance_name.clone());
                (cluster, inbox)
            }
            ClusterMode::Mqtt => {
                let (cluster, inbox) = MqttCluster::start(&config, shutdown.child_token());
                (cluster, inbox)
            }
        };

    let coordinator = Arc::new(Coordinator::new(
        config.bluetooth.clone(),
        cluster,
        pipeline,
        Arc::new(EntityRegistry::new()),
        shutdown.clone(),
    ));
    if let Err(e) = coordinator.bootstrap().await {
        error!("Failed to join the cluster: {}", e);
        std::process::exit(1);
    }

    let run_task = tokio::spawn(Arc::clone(&coordinator).run(inbox));

    info!("Coordinator is running, press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    coordinator.shutdown().await;
    if let Err(e) = run_task.await {
        error!("Coordinator task failed: {}", e);
    }

    info!("Bluetooth presence coordinator stopped");
}
