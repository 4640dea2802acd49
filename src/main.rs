use clap::{CommandFactory, Parser};
use garage_controller::broker::{MessageBroker, MqttBroker};
use garage_controller::config::Config;
use garage_controller::error::Result;
use garage_controller::hardware::{
    HardwareAccess, PigpioClient, ThermometerBus, W1_DEVICES_DIR, W1Bus,
};
use garage_controller::logging;
use garage_controller::sensors::Devices;
use garage_controller::supervisor::{StopHandle, Supervisor};
use log::{error, info};
use std::sync::Arc;
use tokio::signal;

/// Publish garage sensors to MQTT and accept door actuation requests.
#[derive(Debug, Parser)]
#[command(name = "garage", version)]
struct Args {
    /// Configuration as an inline JSON object or a path to a JSON file
    #[arg(long, env = "GARAGE_CONFIG")]
    config: String,
}

async fn wait_for_signal(stop: StopHandle) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Received shutdown signal");
    stop.stop();
}

async fn run(config: Config) -> Result<()> {
    info!("Setting up.");

    let broker: Arc<dyn MessageBroker> = Arc::new(MqttBroker::new(&config.mqtt)?);
    let hardware: Arc<dyn HardwareAccess> = Arc::new(PigpioClient::connect(&config.gpio).await?);
    let thermometers =
        W1Bus::probe(W1_DEVICES_DIR).map(|bus| Arc::new(bus) as Arc<dyn ThermometerBus>);

    let supervisor = Supervisor::new(
        &config,
        Devices {
            broker,
            hardware,
            thermometers,
        },
    );
    tokio::spawn(wait_for_signal(supervisor.stop_handle()));

    info!("Start.");
    supervisor.run().await?;
    info!("End.");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init() {
        eprintln!("Failed to install logger: {}", e);
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            let _ = Args::command().print_help();
            std::process::exit(1);
        }
    };

    logging::apply_configured(&config.logging.level);

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
