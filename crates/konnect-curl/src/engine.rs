//! Transfer bookkeeping on top of a [`MultiSession`].
//!
//! # Design
//! - Owns the session and the responder of every transfer the session knows about.
//! - A transfer is resolved exactly once: by its completion, by cancellation, or by
//!   shutdown, whichever the engine task observes first.
//! - Errors from socket/timeout notifications are logged, not fatal; the affected
//!   transfers surface their failures through completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use konnect_core::{ResponseHead, TransferError, TransferId, TransferResult};
use konnect_telemetry::{Metrics, ResolveOutcome};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::command::PendingTransfer;
use crate::error::engine_fault;
use crate::registry::{Registration, RegistrationQueue};
use crate::session::{Completion, MultiSession, NativeFailure, NewTransfer, RawSocket, Readiness};

struct InFlight {
    respond_to: oneshot::Sender<TransferResult<ResponseHead>>,
    submitted_at: Instant,
}

pub(crate) struct TransferEngine {
    session: Box<dyn MultiSession>,
    registrations: Arc<RegistrationQueue>,
    in_flight: HashMap<TransferId, InFlight>,
    metrics: Option<Metrics>,
}

impl TransferEngine {
    /// Bind the session's callbacks to a fresh registration queue.
    pub(crate) fn new(mut session: Box<dyn MultiSession>, metrics: Option<Metrics>) -> Result<Self> {
        let registrations = Arc::new(RegistrationQueue::default());
        session
            .bind(registrations.clone(), registrations.clone())
            .context("failed to bind engine callbacks")?;
        Ok(Self {
            session,
            registrations,
            in_flight: HashMap::new(),
            metrics,
        })
    }

    /// Hand a transfer to the engine. A rejected transfer is resolved immediately.
    pub(crate) fn submit(&mut self, pending: PendingTransfer) {
        let PendingTransfer {
            id,
            url,
            request,
            body,
            respond_to,
        } = pending;
        let target = url.to_string();
        let transfer = NewTransfer {
            id,
            url,
            request,
            body,
        };

        match self.session.add_transfer(transfer) {
            Ok(()) => {
                debug!(transfer_id = %id, target = %target, "transfer added to engine");
                self.in_flight.insert(
                    id,
                    InFlight {
                        respond_to,
                        submitted_at: Instant::now(),
                    },
                );
                self.publish_in_flight();
            }
            Err(err) => {
                warn!(transfer_id = %id, target = %target, error = %format!("{err:#}"), "engine rejected transfer");
                self.record_resolved(ResolveOutcome::Faulted);
                let _ = respond_to.send(Err(engine_fault("add_transfer", &err)));
            }
        }
    }

    /// Remove a pending transfer and resolve it as cancelled.
    ///
    /// Returns `false` when the transfer already resolved; its outcome stands.
    pub(crate) fn cancel(&mut self, id: TransferId) -> bool {
        let Some(entry) = self.in_flight.remove(&id) else {
            trace!(transfer_id = %id, "cancel ignored for resolved transfer");
            return false;
        };
        if let Err(err) = self.session.remove_transfer(id) {
            warn!(transfer_id = %id, error = %format!("{err:#}"), "engine failed to remove cancelled transfer");
        }
        debug!(transfer_id = %id, "transfer cancelled");
        // Metrics first: a caller woken by the send must see them settled.
        self.record_resolved(ResolveOutcome::Cancelled);
        self.publish_in_flight();
        let _ = entry.respond_to.send(Err(TransferError::Cancelled));
        true
    }

    /// Report socket readiness to the engine, then resolve whatever it finished.
    pub(crate) fn notify_socket(&mut self, socket: RawSocket, readiness: Readiness) {
        self.record_action("socket");
        match self.session.socket_action(socket, readiness) {
            Ok(running) => trace!(socket, running, "socket action"),
            Err(err) => warn!(socket, error = %format!("{err:#}"), "socket action failed"),
        }
        self.drain();
    }

    /// Report an expired deadline to the engine, then resolve whatever it finished.
    pub(crate) fn notify_timeout(&mut self) {
        self.record_action("timeout");
        match self.session.timeout_action() {
            Ok(running) => trace!(running, "timeout action"),
            Err(err) => warn!(error = %format!("{err:#}"), "timeout action failed"),
        }
        self.drain();
    }

    /// Callbacks the engine raised since the last call, in arrival order.
    pub(crate) fn take_registrations(&self) -> Vec<Registration> {
        self.registrations.take()
    }

    /// Cancel every transfer still owned by the engine.
    pub(crate) fn shutdown(&mut self) {
        let ids: Vec<TransferId> = self.in_flight.keys().copied().collect();
        if !ids.is_empty() {
            debug!(pending = ids.len(), "cancelling transfers for shutdown");
        }
        for id in ids {
            self.cancel(id);
        }
        // Nothing will watch these sockets again.
        let _ = self.registrations.take();
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: TransferId) -> bool {
        self.in_flight.contains_key(&id)
    }

    fn drain(&mut self) {
        let completions = self.session.drain_completions();
        if completions.is_empty() {
            return;
        }
        let mut resolutions = Vec::with_capacity(completions.len());
        for Completion { id, outcome } in completions {
            let Some(entry) = self.in_flight.remove(&id) else {
                debug!(transfer_id = %id, "completion for unknown transfer ignored");
                continue;
            };
            let elapsed_ms = entry.submitted_at.elapsed().as_millis();
            let (result, resolved) = match outcome {
                Ok(head) => {
                    debug!(transfer_id = %id, status = head.status, elapsed_ms, "transfer completed");
                    (Ok(head), ResolveOutcome::Succeeded)
                }
                Err(NativeFailure { code, message }) => {
                    debug!(transfer_id = %id, code, message = %message, elapsed_ms, "transfer failed");
                    (
                        Err(TransferError::TransferFailed { code, message }),
                        ResolveOutcome::Failed,
                    )
                }
            };
            self.record_resolved(resolved);
            resolutions.push((entry.respond_to, result));
        }
        self.publish_in_flight();
        for (respond_to, result) in resolutions {
            let _ = respond_to.send(result);
        }
    }

    fn record_action(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_engine_action(kind);
        }
    }

    fn record_resolved(&self, outcome: ResolveOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_resolved(outcome);
        }
    }

    fn publish_in_flight(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_in_flight(self.in_flight.len());
        }
    }
}
