#![allow(clippy::redundant_pub_crate)]

//! Boundary between the bridge and the native multi-transfer engine.
//!
//! # Design
//!
//! - The engine never calls into the bridge directly; it reports socket interest and
//!   timer requests through two narrow sink traits installed with [`MultiSession::bind`].
//! - Sinks may be invoked synchronously from inside any session call, so callers must
//!   collect what they reported before suspending again.
//! - Completions returned by [`MultiSession::drain_completions`] are already detached
//!   from the engine; no further `remove_transfer` is needed for them.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use konnect_core::{Request, ResponseHead, TransferId};
use url::Url;

use crate::handle::BodySink;
use crate::types::BridgeConfig;

#[cfg(feature = "libcurl")]
#[allow(unsafe_code)]
mod native;
#[cfg(any(test, not(feature = "libcurl")))]
mod stub;

#[cfg(test)]
pub(crate) use stub::{StubAction, StubControl, StubSession};

/// Socket identifier as handed out by the engine.
pub(crate) type RawSocket = RawFd;

/// Directions the engine wants to be told about for one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SocketInterest {
    /// Wake when the socket becomes readable.
    pub(crate) readable: bool,
    /// Wake when the socket becomes writable.
    pub(crate) writable: bool,
}

impl SocketInterest {
    /// Interest has been withdrawn.
    pub(crate) const NONE: Self = Self::new(false, false);
    /// Readable only.
    pub(crate) const READ: Self = Self::new(true, false);
    /// Writable only.
    #[cfg(any(test, feature = "libcurl"))]
    pub(crate) const WRITE: Self = Self::new(false, true);
    /// Both directions.
    #[cfg(any(test, feature = "libcurl"))]
    pub(crate) const BOTH: Self = Self::new(true, true);

    /// Build an interest set from raw flags.
    #[must_use]
    pub(crate) const fn new(readable: bool, writable: bool) -> Self {
        Self { readable, writable }
    }

    /// Whether no direction is requested.
    #[must_use]
    pub(crate) const fn is_none(self) -> bool {
        !self.readable && !self.writable
    }
}

/// Observed socket state passed back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Readiness {
    /// Socket is readable.
    pub(crate) readable: bool,
    /// Socket is writable.
    pub(crate) writable: bool,
    /// Socket reported an error condition.
    pub(crate) error: bool,
}

impl Readiness {
    /// Readiness reporting only an error condition.
    #[must_use]
    pub(crate) const fn error() -> Self {
        Self {
            readable: false,
            writable: false,
            error: true,
        }
    }

    /// Whether anything at all was observed.
    #[must_use]
    pub(crate) const fn is_empty(self) -> bool {
        !self.readable && !self.writable && !self.error
    }
}

/// Receives "socket interest changed" requests from the engine.
pub(crate) trait SocketInterestSink: Send + Sync {
    fn socket_interest_changed(&self, socket: RawSocket, interest: SocketInterest);
}

/// Receives "next deadline" requests from the engine; `None` cancels the timer.
pub(crate) trait TimeoutSink: Send + Sync {
    fn timeout_requested(&self, delay: Option<Duration>);
}

/// Failure reported by the engine for a single transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NativeFailure {
    pub(crate) code: i32,
    pub(crate) message: String,
}

/// One finished transfer as reported by the engine.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) id: TransferId,
    pub(crate) outcome: Result<ResponseHead, NativeFailure>,
}

/// Everything the engine needs to start a transfer.
pub(crate) struct NewTransfer {
    pub(crate) id: TransferId,
    pub(crate) url: Url,
    pub(crate) request: Request,
    pub(crate) body: BodySink,
}

pub(crate) trait MultiSession: Send {
    /// Install the callback sinks; called once before any other method.
    fn bind(
        &mut self,
        sockets: Arc<dyn SocketInterestSink>,
        timer: Arc<dyn TimeoutSink>,
    ) -> Result<()>;
    fn add_transfer(&mut self, transfer: NewTransfer) -> Result<()>;
    /// Returns `false` when the engine did not know the transfer.
    fn remove_transfer(&mut self, id: TransferId) -> Result<bool>;
    /// Returns the number of transfers still running.
    fn socket_action(&mut self, socket: RawSocket, readiness: Readiness) -> Result<usize>;
    /// Returns the number of transfers still running.
    fn timeout_action(&mut self) -> Result<usize>;
    fn drain_completions(&mut self) -> Vec<Completion>;
}

pub(crate) fn create_session(config: &BridgeConfig) -> Result<Box<dyn MultiSession>> {
    #[cfg(feature = "libcurl")]
    {
        native::create_session(config)
    }

    #[cfg(not(feature = "libcurl"))]
    {
        let _ = config;
        Ok(Box::new(stub::StubSession::default()))
    }
}
