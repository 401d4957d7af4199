use std::path::PathBuf;

use clap::Parser;

use meshwatch_bridge::config::Overrides;
use meshwatch_bridge::{BridgeConfig, run_service};

#[derive(Parser)]
#[command(name = "meshwatch", about = "Relay Meshtastic radio events to an MQTT broker")]
struct Cli {
    /// Path to configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Serial device the radio is attached to
    #[arg(long)]
    serial_port: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match BridgeConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };
    config.apply_overrides(Overrides {
        broker_host: cli.broker_host,
        broker_port: cli.broker_port,
        serial_port: cli.serial_port,
    });
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        meshwatch_bridge::logging::init_json(&config.logging.level);
    } else {
        meshwatch_bridge::logging::init(&config.logging.level);
    }

    if let Err(e) = run_service(config).await {
        tracing::error!("bridge failed: {e}");
        eprintln!("meshwatch: {e}");
        std::process::exit(1);
    }
}
