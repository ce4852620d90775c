#![deny(unsafe_code)]
#![warn(
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Cooperative bridge between async callers and libcurl's multi interface.
//!
//! A [`CurlBridge`] owns one multi session driven by a single background task. Callers
//! submit requests and await [`TransferHandle`]s; the task turns the engine's socket and
//! timer requests into reactor waits and feeds readiness back to the engine.

mod command;
mod engine;
/// Bridge-internal error types and conversions.
pub mod error;
mod handle;
mod registry;
mod session;
mod sockets;
mod timer;
/// Bridge configuration.
pub mod types;
mod worker;

pub use error::CurlBridgeError;
pub use handle::{BodyChunks, TransferHandle};
pub use types::{BridgeConfig, ConfigError};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use command::{BridgeCommand, PendingTransfer};
use engine::TransferEngine;
use konnect_core::{Request, Response, TransferError, TransferId, TransferResult, Transport};
use konnect_telemetry::Metrics;
use session::MultiSession;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use worker::EventLoopBridge;

/// Handle onto a running bridge. Clones share the same engine.
#[derive(Clone, Debug)]
pub struct CurlBridge {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl CurlBridge {
    /// Create the engine session and spawn the bridge task on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the session cannot be created,
    /// or no Tokio runtime is active.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::start(&config, None)
    }

    /// Like [`CurlBridge::new`], recording bridge activity into `metrics`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`CurlBridge::new`].
    pub fn with_metrics(config: BridgeConfig, metrics: Metrics) -> Result<Self> {
        Self::start(&config, Some(metrics))
    }

    fn start(config: &BridgeConfig, metrics: Option<Metrics>) -> Result<Self> {
        config.validate().context("invalid bridge configuration")?;
        let session = session::create_session(config).context("failed to create curl session")?;
        Self::with_session(session, metrics)
    }

    pub(crate) fn with_session(
        session: Box<dyn MultiSession>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .context("curl bridge must be started inside a Tokio runtime")?;
        let engine = TransferEngine::new(session, metrics.clone())?;
        let (commands, receiver) = mpsc::unbounded_channel();
        EventLoopBridge::new(engine, metrics).spawn(receiver);
        info!("curl bridge started");

        Ok(Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Validate `request` and hand it to the engine without suspending.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] when the request cannot be sent and
    /// [`TransferError::BridgeClosed`] after [`CurlBridge::shutdown`].
    pub fn submit(&self, request: Request) -> TransferResult<TransferHandle> {
        if self.is_closed() {
            return Err(TransferError::BridgeClosed);
        }
        let url = request.validate()?;
        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (respond_to, outcome) = oneshot::channel();
        let (body, chunks) = handle::body_channel();

        debug!(transfer_id = %id, method = %request.method, target = %url, "submitting transfer");
        self.commands
            .send(BridgeCommand::Submit(Box::new(PendingTransfer {
                id,
                url,
                request,
                body,
                respond_to,
            })))
            .map_err(|_| TransferError::BridgeClosed)?;

        Ok(TransferHandle::new(
            id,
            outcome,
            chunks,
            self.commands.clone(),
        ))
    }

    /// Stop the bridge: pending transfers resolve as cancelled and the engine is released
    /// before this returns. Later submissions fail with [`TransferError::BridgeClosed`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let (respond_to, done) = oneshot::channel();
        if self
            .commands
            .send(BridgeCommand::Shutdown { respond_to })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Whether [`CurlBridge::shutdown`] has been requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }
}

#[async_trait]
impl Transport for CurlBridge {
    async fn process(&self, request: Request) -> TransferResult<Response> {
        self.submit(request)?.await
    }
}
