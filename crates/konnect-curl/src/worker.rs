//! Background task that owns the engine and drives it from reactor events.
//!
//! # Design
//! - The only task that calls into the engine. Callers reach it through the command
//!   channel; the engine reaches it through the registration queue.
//! - Registrations raised by an engine call are applied before the task suspends again.
//! - One wake may carry several stimuli (sockets and the timer). Each gets its own
//!   notification, in the order observed, and all of them are processed before the
//!   next wait.

use std::io;
use std::task::{Context, Poll, Waker};

use konnect_core::TransferError;
use konnect_telemetry::{Metrics, ResolveOutcome};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::command::{BridgeCommand, PendingTransfer};
use crate::engine::TransferEngine;
use crate::error::CurlBridgeError;
use crate::registry::Registration;
use crate::session::{RawSocket, Readiness};
use crate::sockets::{SocketReady, SocketWaitSet};
use crate::timer::{TimerDriver, TimerOutcome};

/// One thing the engine has to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stimulus {
    Socket(SocketReady),
    Timer,
}

enum Wake {
    Command(Option<BridgeCommand>),
    Sockets(Vec<SocketReady>),
    Timer(TimerOutcome),
}

pub(crate) struct EventLoopBridge {
    engine: TransferEngine,
    sockets: SocketWaitSet,
    timer: TimerDriver,
    metrics: Option<Metrics>,
}

impl EventLoopBridge {
    pub(crate) fn new(engine: TransferEngine, metrics: Option<Metrics>) -> Self {
        Self {
            engine,
            sockets: SocketWaitSet::default(),
            timer: TimerDriver::default(),
            metrics,
        }
    }

    /// Run the bridge on the current runtime until shutdown.
    pub(crate) fn spawn(self, commands: mpsc::UnboundedReceiver<BridgeCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BridgeCommand>) {
        let first_ack = loop {
            self.settle();

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                ready = self.sockets.ready() => Wake::Sockets(ready),
                outcome = self.timer.wait() => Wake::Timer(outcome),
            };

            match wake {
                Wake::Command(Some(BridgeCommand::Shutdown { respond_to })) => {
                    break Some(respond_to);
                }
                Wake::Command(Some(BridgeCommand::Submit(pending))) => self.submit(*pending),
                Wake::Command(Some(BridgeCommand::Cancel { id })) => {
                    self.engine.cancel(id);
                }
                Wake::Command(None) => break None,
                Wake::Sockets(ready) => self.on_sockets(ready),
                Wake::Timer(TimerOutcome::Fired) => self.on_timer(),
                Wake::Timer(TimerOutcome::Superseded) => {}
            }
        };

        let mut acks = self.teardown(&mut commands);
        acks.extend(first_ack);
        // Release the engine before anyone learns the bridge is down.
        drop(self);
        debug!("curl bridge stopped");
        for ack in acks {
            let _ = ack.send(());
        }
    }

    fn submit(&mut self, pending: PendingTransfer) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_submitted();
        }
        self.engine.submit(pending);
    }

    /// Bring waits in line with what the engine asked for before suspending.
    fn settle(&mut self) {
        self.apply_registrations();

        // Nothing to wait for when the engine wants to be called back right away.
        if self.timer.take_if_due(Instant::now()) {
            trace!("serving immediate timeout");
            self.drive(vec![Stimulus::Timer]);
        }

        loop {
            let failed = self.sockets.rearm();
            if failed.is_empty() {
                break;
            }
            for (socket, source) in failed {
                self.registration_failed(socket, source);
            }
            self.apply_registrations();
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_sockets_watched(self.sockets.len());
        }
    }

    fn apply_registrations(&mut self) {
        loop {
            let pending = self.engine.take_registrations();
            if pending.is_empty() {
                return;
            }
            for registration in pending {
                match registration {
                    Registration::Socket { socket, interest } => {
                        trace!(socket, ?interest, "socket interest changed");
                        if let Err(source) = self.sockets.watch(socket, interest) {
                            self.registration_failed(socket, source);
                        }
                    }
                    Registration::Timeout(deadline) => self.timer.arm(deadline),
                }
            }
        }
    }

    /// Fail the socket's transfer through the engine instead of leaving it hanging.
    fn registration_failed(&mut self, socket: RawSocket, source: io::Error) {
        let err = CurlBridgeError::SocketRegistration { socket, source };
        warn!(socket, error = ?err, "engine socket could not be watched");
        self.sockets.unwatch(socket);
        self.engine.notify_socket(socket, Readiness::error());
    }

    fn on_sockets(&mut self, ready: Vec<SocketReady>) {
        let mut stimuli: Vec<Stimulus> = ready.into_iter().map(Stimulus::Socket).collect();
        if self.timer.take_if_due(Instant::now()) {
            stimuli.push(Stimulus::Timer);
        }
        self.drive(stimuli);
    }

    fn on_timer(&mut self) {
        let mut stimuli = vec![Stimulus::Timer];
        let mut cx = Context::from_waker(Waker::noop());
        if let Poll::Ready(ready) = self.sockets.poll_ready(&mut cx) {
            stimuli.extend(ready.into_iter().map(Stimulus::Socket));
        }
        self.drive(stimuli);
    }

    fn drive(&mut self, stimuli: Vec<Stimulus>) {
        for stimulus in stimuli {
            match stimulus {
                Stimulus::Socket(SocketReady { socket, readiness }) => {
                    // An earlier notification in this wake may have retired the socket.
                    if !self.sockets.is_watching(socket) {
                        trace!(socket, "skipping readiness for unwatched socket");
                        continue;
                    }
                    self.engine.notify_socket(socket, readiness);
                }
                Stimulus::Timer => self.engine.notify_timeout(),
            }
            self.apply_registrations();
        }
    }

    fn teardown(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<BridgeCommand>,
    ) -> Vec<oneshot::Sender<()>> {
        debug!(
            in_flight = self.engine.in_flight_len(),
            sockets = self.sockets.len(),
            "shutting down curl bridge"
        );
        self.engine.shutdown();
        self.sockets.clear();
        self.timer.arm(None);
        if let Some(metrics) = &self.metrics {
            metrics.set_sockets_watched(0);
        }

        commands.close();
        let mut acks = Vec::new();
        while let Ok(command) = commands.try_recv() {
            match command {
                BridgeCommand::Submit(pending) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_resolved(ResolveOutcome::Closed);
                    }
                    let _ = pending.respond_to.send(Err(TransferError::BridgeClosed));
                }
                BridgeCommand::Cancel { .. } => {}
                BridgeCommand::Shutdown { respond_to } => acks.push(respond_to),
            }
        }
        acks
    }
}
