use konnect_core::{Request, ResponseHead, TransferId, TransferResult};
use tokio::sync::oneshot;
use url::Url;

use crate::handle::BodySink;

/// Control messages sent from callers and handles to the bridge task.
#[derive(Debug)]
pub(crate) enum BridgeCommand {
    /// Hand a validated request to the engine.
    Submit(Box<PendingTransfer>),
    /// Remove a still-pending transfer.
    Cancel {
        /// Transfer to remove.
        id: TransferId,
    },
    /// Stop the bridge; acknowledged once the engine has been released.
    Shutdown {
        /// Channel signalled after teardown.
        respond_to: oneshot::Sender<()>,
    },
}

/// A validated request on its way to the engine.
#[derive(Debug)]
pub(crate) struct PendingTransfer {
    pub(crate) id: TransferId,
    pub(crate) url: Url,
    pub(crate) request: Request,
    pub(crate) body: BodySink,
    pub(crate) respond_to: oneshot::Sender<TransferResult<ResponseHead>>,
}
