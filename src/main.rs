//! CEC Sink GW - Rust implementation
//!
//! TV-side HDMI-CEC protocol engine: logical address allocation, device and
//! topology tracking, ARC routing and remote-key forwarding. The binary runs
//! the engine against the simulated bus so the protocol machinery can be
//! exercised without HDMI hardware; platform integrations plug a real
//! transport into the same `CecBus` seam.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod engine;
mod message;
mod settings;
mod transport;

use crate::config::AppConfig;
use crate::engine::CecSinkEngine;
use crate::message::PhysicalAddress;
use crate::transport::sim::{SimBus, SimDevice};

/// CEC Sink GW - HDMI-CEC sink protocol engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Attach a simulated playback device and soundbar to the bus
    #[arg(long)]
    demo_devices: bool,

    /// Dump the device list periodically
    #[arg(long)]
    watch_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting CEC Sink GW...");
    info!("Configuration file: {}", args.config);

    let config = match AppConfig::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            info!("Config not loaded ({}), using defaults", e);
            AppConfig::default()
        }
    };

    let bus = Arc::new(SimBus::new());
    if args.demo_devices {
        bus.attach(SimDevice::playback(4, PhysicalAddress::new(1, 0, 0, 0)));
        bus.attach(SimDevice::audio_system(PhysicalAddress::new(2, 0, 0, 0)));
        info!("Simulated playback device and soundbar attached");
    }

    let engine = Arc::new(CecSinkEngine::start(config, bus).await?);
    info!(
        "Engine up, logical address: {:?}",
        engine.logical_address()
    );

    // Relay engine notifications into the log
    let mut events = engine.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("event: {:?}", event);
        }
    });

    if args.watch_devices {
        let watcher = engine.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                watcher.print_device_list();
            }
        });
    }

    shutdown_signal().await;

    engine.shutdown().await?;
    event_task.abort();
    info!("CEC Sink GW shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
