//! Paraglider emulator - load generator for the tracking platform

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use para_emulator::config::{Args, Config};
use para_emulator::guard::{spawn_signal_handler, InstanceGuard};
use para_emulator::orchestrator::Simulation;
use para_emulator::rate_limit::RateLimiter;
use para_emulator::registration::RegistrationPipeline;
use para_sdk::{MqttConnector, MqttSettings, RegistrationClient, TlsSettings};

const MQTT_KEEP_ALIVE_SECS: u64 = 30;
const MQTT_CONNECT_TIMEOUT_SECS: u64 = 10;
const MQTT_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("para_emulator=info".parse()?))
        .init();

    let args = Args::parse();
    let config = Config::from_env().with_args(&args, |key| env::var(key).ok());

    config.validate()?;
    let manufacturer_secret = config.resolve_manufacturer_secret()?;
    config.check_certificates()?;

    if !config.safe_mode {
        tracing::warn!("Running in UNSAFE mode: 1-second GPS updates, no API rate limiting");
    }
    tracing::info!("Manufacturer: {}", config.manufacturer);
    tracing::info!("API: {}", config.api_base_url());
    tracing::info!("MQTT: {}:{} as {}", config.mqtt_host(), config.mqtt_port, config.mqtt_user);
    tracing::info!(
        "Update interval: {:?}, API rate limit: {}",
        config.update_interval(),
        config
            .api_rate_limit()
            .map(|limit| format!("{} req/s", limit))
            .unwrap_or_else(|| "disabled".to_string())
    );

    let guard = InstanceGuard::acquire(&config.lock_file, config.devices)?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let tls = if config.insecure_tls {
        tracing::warn!("TLS verification disabled (--insecure-tls): broker and API certificates are not checked");
        TlsSettings::Insecure
    } else if config.skip_hostname_check {
        tracing::warn!(
            "Broker host name not checked (--skip-hostname-check): certificate chain is still verified against {}",
            config.ca_cert.display()
        );
        TlsSettings::from_files(&config.ca_cert, &config.client_cert, &config.client_key)?.without_hostname_check()
    } else {
        TlsSettings::from_files(&config.ca_cert, &config.client_cert, &config.client_key)?
    };
    let connector = MqttConnector::new(MqttSettings {
        host: config.mqtt_host().to_string(),
        port: config.mqtt_port,
        keep_alive: Duration::from_secs(MQTT_KEEP_ALIVE_SECS),
        connect_timeout: Duration::from_secs(MQTT_CONNECT_TIMEOUT_SECS),
        capacity: MQTT_QUEUE_CAPACITY,
        tls,
    });

    let client = RegistrationClient::new(config.api_base_url(), config.insecure_tls)
        .context("Failed to build registration client")?;
    let pipeline = RegistrationPipeline::new(
        client,
        RateLimiter::from_limit(config.api_rate_limit()),
        config.manufacturer.clone(),
        manufacturer_secret,
        config.retry.clone(),
    );

    let summary = Simulation::new(config, pipeline, connector, shutdown)
        .run(guard)
        .await;

    tracing::info!(
        "Sent {} GPS points from {}/{} registered devices",
        summary.simulation.total_points,
        summary.simulation.registered_devices,
        summary.simulation.devices
    );
    Ok(())
}
