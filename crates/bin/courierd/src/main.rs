//! # courierd: courier daemon
//!
//! Composition root that builds the configured event bus and runs it.
//!
//! ## Responsibilities
//! - Load configuration (`courier.toml`, environment overrides)
//! - Initialise logging
//! - Build the bus flavour selected by `bus.mode` through a `BusRegistry`
//! - Attach a tap subscription that logs every matching event
//! - Shut the bus down gracefully on SIGTERM/SIGINT
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no bus logic belongs here.

mod config;
mod wiring;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use courier_app::ports::EventBus;
use courier_domain::{DomainEvent, NewDomainEvent};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_logging(&config.logging.filter);

    let registry = wiring::registry(&config);
    let bus = registry.get().await.context("failed to start event bus")?;
    info!(kind = bus.kind(), tap = config.bus.tap_pattern, "event bus ready");

    let tap = bus
        .subscribe(&config.bus.tap_pattern, wiring::tap())
        .context("failed to attach tap subscription")?;

    let started = DomainEvent::create(
        NewDomainEvent::new(
            "courier.daemon.started",
            json!({ "mode": bus.kind(), "pid": std::process::id() }),
        )
        .source("courierd"),
    )?;
    bus.publish(started)
        .await
        .context("failed to publish startup event")?;

    wait_for_shutdown().await?;
    info!("shutting down");

    tap.unsubscribe();
    registry.shutdown().await;
    info!("courierd stopped");
    Ok(())
}

fn init_logging(filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C");
    Ok(())
}
