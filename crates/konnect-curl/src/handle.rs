//! Caller-side view of a single transfer.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use konnect_core::{Response, ResponseHead, TransferError, TransferId, TransferResult};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;

use crate::command::BridgeCommand;

/// Engine-side end of a transfer's body channel.
#[derive(Debug)]
pub(crate) struct BodySink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl BodySink {
    /// Forward a chunk written by the engine. Chunks for abandoned handles are dropped.
    pub(crate) fn deliver(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(Bytes::copy_from_slice(data));
    }
}

pub(crate) fn body_channel() -> (BodySink, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BodySink { tx }, rx)
}

/// Awaitable result of a submitted transfer.
///
/// Awaiting resolves once the bridge reports the outcome. Dropping the handle before
/// that point asks the bridge to remove the transfer from the engine.
#[derive(Debug)]
pub struct TransferHandle {
    id: TransferId,
    outcome: oneshot::Receiver<TransferResult<ResponseHead>>,
    chunks: Option<mpsc::UnboundedReceiver<Bytes>>,
    commands: mpsc::UnboundedSender<BridgeCommand>,
    resolved: bool,
}

impl TransferHandle {
    pub(crate) const fn new(
        id: TransferId,
        outcome: oneshot::Receiver<TransferResult<ResponseHead>>,
        chunks: mpsc::UnboundedReceiver<Bytes>,
        commands: mpsc::UnboundedSender<BridgeCommand>,
    ) -> Self {
        Self {
            id,
            outcome,
            chunks: Some(chunks),
            commands,
            resolved: false,
        }
    }

    /// Identifier assigned to this transfer.
    #[must_use]
    pub const fn id(&self) -> TransferId {
        self.id
    }

    /// Ask the bridge to remove the transfer.
    ///
    /// If the engine already reported a completion, that completion is what the handle
    /// resolves to.
    pub fn cancel(&self) {
        if !self.resolved {
            let _ = self.commands.send(BridgeCommand::Cancel { id: self.id });
        }
    }

    /// Take the body as a lazy stream of chunks.
    ///
    /// Chunks received before the call are yielded first. The stream ends when the
    /// transfer ends, whatever its outcome; await the handle for the status. After this
    /// call the awaited [`Response`] carries an empty body. Calling it a second time
    /// returns an already-finished stream.
    pub fn body_chunks(&mut self) -> BodyChunks {
        BodyChunks {
            inner: self.chunks.take(),
        }
    }

    fn collect_body(&mut self) -> Bytes {
        let Some(mut chunks) = self.chunks.take() else {
            return Bytes::new();
        };
        let mut body = BytesMut::new();
        while let Ok(chunk) = chunks.try_recv() {
            body.extend_from_slice(&chunk);
        }
        body.freeze()
    }
}

impl Future for TransferHandle {
    type Output = TransferResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.resolved {
            return Poll::Ready(Err(TransferError::Cancelled));
        }
        let outcome = ready!(Pin::new(&mut self.outcome).poll(cx));
        self.resolved = true;
        Poll::Ready(match outcome {
            Ok(Ok(head)) => {
                let body = self.collect_body();
                Ok(Response::new(head, body))
            }
            Ok(Err(err)) => Err(err),
            // The bridge dropped the responder without resolving: it is gone.
            Err(_) => Err(TransferError::Cancelled),
        })
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Forward-only stream of body chunks for one transfer.
#[derive(Debug)]
pub struct BodyChunks {
    inner: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl BodyChunks {
    /// Yield the next body chunk, or `None` once the transfer has ended.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl Stream for BodyChunks {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let Some(rx) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        let next = ready!(rx.poll_recv(cx));
        if next.is_none() {
            self.inner = None;
        }
        Poll::Ready(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn handle_parts() -> (
        TransferHandle,
        BodySink,
        oneshot::Sender<TransferResult<ResponseHead>>,
        mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        let (respond_to, outcome) = oneshot::channel();
        let (sink, chunks) = body_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let handle = TransferHandle::new(TransferId(1), outcome, chunks, commands);
        (handle, sink, respond_to, command_rx)
    }

    #[tokio::test]
    async fn resolved_handle_collects_buffered_body() {
        let (handle, sink, respond_to, _commands) = handle_parts();
        sink.deliver(b"hello ");
        sink.deliver(b"world");
        drop(sink);
        let head = ResponseHead {
            status: 200,
            headers: Vec::new(),
        };
        respond_to.send(Ok(head)).expect("handle alive");

        let response = handle.await.expect("transfer succeeded");
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn streaming_consumer_sees_chunks_and_end() {
        let (mut handle, sink, respond_to, _commands) = handle_parts();
        sink.deliver(b"early");
        let mut chunks = handle.body_chunks();
        assert_eq!(chunks.next().await, Some(Bytes::from_static(b"early")));

        sink.deliver(b"late");
        drop(sink);
        assert_eq!(chunks.next_chunk().await, Some(Bytes::from_static(b"late")));
        assert_eq!(chunks.next_chunk().await, None);
        assert_eq!(chunks.next_chunk().await, None);

        respond_to
            .send(Ok(ResponseHead::default()))
            .expect("handle alive");
        let response = handle.await.expect("transfer succeeded");
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn second_body_stream_is_empty() {
        let (mut handle, _sink, _respond_to, _commands) = handle_parts();
        let _first = handle.body_chunks();
        let mut second = handle.body_chunks();
        assert_eq!(second.next().await, None);
    }

    #[tokio::test]
    async fn dropping_unresolved_handle_requests_cancel() {
        let (handle, _sink, _respond_to, mut commands) = handle_parts();
        drop(handle);
        match commands.recv().await {
            Some(BridgeCommand::Cancel { id }) => assert_eq!(id, TransferId(1)),
            other => panic!("expected cancel command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolved_handle_does_not_cancel_on_drop() {
        let (mut handle, _sink, respond_to, mut commands) = handle_parts();
        respond_to
            .send(Err(TransferError::TransferFailed {
                code: 7,
                message: "refused".into(),
            }))
            .expect("handle alive");
        let result = (&mut handle).await;
        assert!(matches!(
            result,
            Err(TransferError::TransferFailed { code: 7, .. })
        ));
        drop(handle);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_responder_resolves_as_cancelled() {
        let (handle, _sink, respond_to, _commands) = handle_parts();
        drop(respond_to);
        assert_eq!(handle.await, Err(TransferError::Cancelled));
    }
}
