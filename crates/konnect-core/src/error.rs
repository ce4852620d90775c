//! Error types for transfer operations.

use thiserror::Error;

/// Primary error type surfaced to callers awaiting a transfer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// The request descriptor was rejected before reaching the engine.
    #[error("invalid request")]
    InvalidRequest {
        /// Request field that failed validation.
        field: &'static str,
        /// Static reason describing the rejection.
        reason: &'static str,
    },
    /// The engine reported a transfer-level failure.
    #[error("transfer failed")]
    TransferFailed {
        /// Native result code reported by the engine.
        code: i32,
        /// Human-readable detail reported by the engine.
        message: String,
    },
    /// The transfer was removed before it completed.
    #[error("transfer cancelled")]
    Cancelled,
    /// The engine itself failed while servicing this transfer.
    #[error("transfer engine fault")]
    EngineFault {
        /// Engine operation that failed.
        operation: &'static str,
        /// Native error message payload.
        message: String,
    },
    /// The bridge has shut down and accepts no further transfers.
    #[error("transfer bridge closed")]
    BridgeClosed,
}

impl TransferError {
    /// Convenience constructor for validation failures.
    #[must_use]
    pub const fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidRequest { field, reason }
    }

    /// Whether the error was raised by cancellation rather than by the transfer itself.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience alias for transfer results.
pub type TransferResult<T> = Result<T, TransferError>;
