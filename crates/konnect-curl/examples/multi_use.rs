//! Fetch several URLs concurrently through a single bridge.
//!
//! Usage: `cargo run -p konnect-curl --example multi_use -- [URL...]`
//!
//! Transfers are started 100ms apart so later ones join a multi session that is
//! already busy. Bridge settings come from `KONNECT_*` environment variables.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use konnect_core::Request;
use konnect_curl::{BridgeConfig, CurlBridge};
use konnect_telemetry::{LoggingConfig, Metrics, init_logging};
use tokio::task::JoinSet;
use tracing::{info, warn};

const DEFAULT_TARGETS: &[&str] = &[
    "https://www.example.com/",
    "https://www.rust-lang.org/",
    "https://httpbin.org/delay/1",
];

const STAGGER: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&LoggingConfig::default())?;

    let mut targets: Vec<String> = std::env::args().skip(1).collect();
    if targets.is_empty() {
        targets = DEFAULT_TARGETS.iter().map(ToString::to_string).collect();
    }

    let config = BridgeConfig::from_env().context("failed to load bridge configuration")?;
    let metrics = Metrics::new()?;
    let bridge = CurlBridge::with_metrics(config, metrics.clone())?;

    let started = Instant::now();
    let mut fetches = JoinSet::new();
    for (index, target) in targets.into_iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(STAGGER).await;
        }
        let handle = bridge.submit(Request::get(target.clone()))?;
        info!(transfer_id = %handle.id(), %target, "transfer started");
        fetches.spawn(async move { (target, handle.await) });
    }

    while let Some(joined) = fetches.join_next().await {
        let (target, outcome) = joined.context("fetch task panicked")?;
        match outcome {
            Ok(response) => info!(
                %target,
                status = response.status(),
                bytes = response.body().len(),
                elapsed_ms = started.elapsed().as_millis(),
                "transfer finished"
            ),
            Err(err) => warn!(%target, error = ?err, "transfer failed"),
        }
    }

    bridge.shutdown().await;
    print!("{}", metrics.render()?);
    Ok(())
}
