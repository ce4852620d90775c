//! # Design
//!
//! - Centralize bridge-internal error context without using `anyhow` at the leaves.
//! - Keep error messages constant; store operational context in fields.
//! - Provide helpers to build caller-facing `TransferError`s from engine failures.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::fd::RawFd;

use konnect_core::TransferError;

#[derive(Debug)]
/// Internal error details used by the curl bridge.
pub enum CurlBridgeError {
    /// The engine session could not be created or configured.
    SessionUnavailable {
        /// Operation that could not be serviced.
        operation: &'static str,
        /// Native error message payload.
        message: String,
    },
    /// A native engine call reported a failure.
    NativeFailure {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Native error message payload.
        message: String,
    },
    /// A socket handed out by the engine could not be registered with the reactor.
    SocketRegistration {
        /// Socket the engine asked to watch.
        socket: RawFd,
        /// Underlying reactor error.
        source: io::Error,
    },
}

impl Display for CurlBridgeError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionUnavailable { operation, message } => {
                let _ = (operation, message);
                formatter.write_str("curl session unavailable")
            }
            Self::NativeFailure { operation, message } => {
                let _ = (operation, message);
                formatter.write_str("curl native error")
            }
            Self::SocketRegistration { socket, .. } => {
                let _ = socket;
                formatter.write_str("socket registration failure")
            }
        }
    }
}

impl Error for CurlBridgeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SocketRegistration { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl CurlBridgeError {
    /// Shorthand for a failed native call.
    pub fn native(operation: &'static str, message: impl Display) -> Self {
        Self::NativeFailure {
            operation,
            message: message.to_string(),
        }
    }
}

/// Build the caller-facing fault for an engine failure on one transfer.
pub fn engine_fault(operation: &'static str, source: &anyhow::Error) -> TransferError {
    TransferError::EngineFault {
        operation,
        message: format!("{source:#}"),
    }
}
