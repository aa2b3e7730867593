use anyhow::Context;
use tokio::io::{stdin, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use simdev::backend::{Gateway, GatewayBackend, MqttBroker};
use simdev::config::{SimulatorConfig, UplinkMode};
use simdev::device::{IntervalPayloads, LinePayloads, PayloadSource, SimulatedDevice};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let config = SimulatorConfig::from_env().context("loading configuration")?;
    info!(
        broker = %config.broker.server,
        dev_eui = %config.device.dev_eui,
        gateway = %config.gateway_id,
        "simdev: starting"
    );

    let broker = MqttBroker::new(&config.broker);
    let backend = GatewayBackend::connect(broker, config.backend_options())
        .await
        .context("connecting gateway backend")?;

    let mut device = SimulatedDevice::from_config(&config, backend);
    let mut source: Box<dyn PayloadSource> = match config.uplink_mode {
        UplinkMode::Stdin => {
            info!("simdev: one uplink per line of standard input");
            Box::new(LinePayloads::new(BufReader::new(stdin())))
        }
        UplinkMode::Interval => Box::new(IntervalPayloads::new(
            config.uplink_payload.clone(),
            config.uplink_interval,
        )),
    };

    let outcome = tokio::select! {
        result = device.run(&mut source) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("simdev: interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = device.gateway().close().await {
        warn!(error = %e, "simdev: backend close failed");
    }

    if let Err(e) = outcome {
        error!(error = %e, "simdev: simulation failed");
        std::process::exit(1);
    }
    Ok(())
}
