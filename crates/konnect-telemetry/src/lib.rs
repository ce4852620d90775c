#![forbid(unsafe_code)]
#![warn(
    unused,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Telemetry primitives shared across the konnect workspace.
//!
//! Logging initialisation and the Prometheus registry live here so every crate reports
//! through the same subscriber and the same collectors.

mod init;
mod metrics;

pub use init::{
    DEFAULT_LOG_LEVEL, LOG_FORMAT_ENV, LogFormat, LoggingConfig, build_sha, init_logging,
    log_format_from_env,
};
pub use metrics::{Metrics, MetricsSnapshot, ResolveOutcome};
