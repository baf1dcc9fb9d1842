//! One-shot signal probe for a single Bluetooth address.
//!
//! Usage:
//!   cargo run --bin rssi-probe -- AA:BB:CC:DD:EE:FF --hci 0
//!
//! Runs the same query the coordinator runs on every tick and prints the raw
//! and filtered signal strength together with the resolved device identity.

use bt_presence_coordinator::config::BluetoothConfig;
use bt_presence_coordinator::radio::{MeasurementPipeline, ShellRunner, hcitool};
use bt_presence_coordinator::signal::{KalmanFilter, MinRssi, range};
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rssi-probe")]
#[command(about = "Measure the signal strength of one Bluetooth Classic device")]
struct Args {
    /// Device address (AA:BB:CC:DD:EE:FF)
    address: String,

    /// HCI adapter number
    #[arg(long, default_value_t = 0)]
    hci: u32,

    /// Query timeout in seconds
    #[arg(long, default_value_t = 4.5)]
    timeout: f64,

    /// Number of samples to take
    #[arg(long, default_value_t = 1)]
    samples: u32,

    /// Readings below this value are reported as out of range
    #[arg(long)]
    min_rssi: Option<f64>,
}

#[tokio::main]
async fn main() {
    bt_presence_coordinator::config::load_dotenv(std::path::Path::new(".env"));
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if !hcitool::is_valid_address(&args.address) {
        error!("Invalid address '{}'", args.address);
        std::process::exit(2);
    }

    let pipeline = MeasurementPipeline::new(
        Arc::new(ShellRunner),
        args.hci,
        Duration::from_secs_f64(args.timeout),
    );
    if let Err(e) = pipeline.check_capability().await {
        error!("{}", e);
        std::process::exit(1);
    }

    let device = pipeline.resolve_device(&args.address).await;
    info!("Device: {} ({})", device.name, device.address);
    if let Some(manufacturer) = &device.manufacturer {
        info!("Manufacturer: {}", manufacturer);
    }

    let min_rssi = args.min_rssi.map(MinRssi::Global);
    let defaults = BluetoothConfig::default();
    let mut filter = KalmanFilter::new(defaults.process_noise, defaults.measurement_noise);

    for sample in 1..=args.samples.max(1) {
        match pipeline.measure_signal(&args.address).await {
            Some(rssi) => {
                let filtered = filter.filter(f64::from(rssi));
                let out_of_range = range::is_out_of_range(min_rssi.as_ref(), &args.address, filtered);
                println!(
                    "#{} rssi={} filtered={:.2}{}",
                    sample,
                    rssi,
                    filtered,
                    if out_of_range { " out_of_range" } else { "" }
                );
            }
            None => println!("#{} no reading", sample),
        }
    }
}
