use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use inbound_bridge::config::{AppConfig, BridgeConfig, LoggingConfig};
use inbound_bridge::dispatch::{DispatchChannel, LoggingConsumer};
use inbound_bridge::mqtt::{ConnectionState, InboundBridge};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config_path()?;
    let config = AppConfig::load(&config_path)
        .await
        .map_err(|e| eyre!("Failed to load {}: {}", config_path.display(), e))?;

    setup_logging(&config.logging)?;
    info!("Configuration loaded from {}", config_path.display());

    let BridgeConfig { topic, options } = config.bridge;
    let channel = DispatchChannel::new(options.channel_capacity);
    channel.register(LoggingConsumer::default()).await;

    let bridge = InboundBridge::new(config.mqtt, channel.clone()).with_options(options);
    let mut handle = bridge
        .start(&topic)
        .await
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;
    info!(
        "Bridge running as {} on '{}', press Ctrl-C to stop",
        handle.client_id(),
        handle.topic()
    );

    let mut states = handle.watch_state();
    states.borrow_and_update();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Disconnected => warn!("Connection to broker lost"),
                ConnectionState::Subscribed => info!("Connection to broker restored"),
                _ => {}
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    handle.stop().await;
    channel.shutdown().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level()?)
        .with_target(false)
        .with_thread_ids(config.thread_ids)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// First CLI argument, falling back to the per-user config directory.
fn config_path() -> Result<PathBuf> {
    match std::env::args().nth(1) {
        Some(path) => Ok(PathBuf::from(path)),
        None => AppConfig::default_path()
            .ok_or_else(|| eyre!("No config path given and no config directory available")),
    }
}
