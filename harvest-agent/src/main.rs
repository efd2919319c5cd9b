use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use harvest_core::{shutdown, RetryPolicy};

mod config;
mod publisher;
mod sampler;
mod transport;

use config::AgentConfig;
use publisher::Publisher;
use sampler::{Sampler, Samples};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::load()?;
    harvest_core::logging::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %cfg.address,
        protocol = ?cfg.protocol,
        "harvest agent starting"
    );

    let samples = Arc::new(Samples::new());
    let transport = transport::build(&cfg, RetryPolicy::default())
        .await
        .context("build transport")?;

    let shutdown_rx = shutdown::shutdown_signal();

    let sampler = Arc::new(Sampler::new(samples.clone()));
    let poller_handle =
        tokio::spawn(sampler.run(cfg.poll_interval, shutdown_rx.resubscribe()));

    let publisher = Publisher::new(samples, transport, cfg.report_interval, cfg.rate_limit);
    publisher.run(shutdown_rx).await;

    if tokio::time::timeout(Duration::from_secs(10), poller_handle).await.is_err() {
        warn!("pollers did not stop in time");
    }

    info!("harvest agent stopped");
    Ok(())
}
