#![cfg_attr(not(test), allow(dead_code))]

//! Scriptable in-process engine used by tests and by builds without libcurl.
//!
//! Each transfer reads its response body from one end of a Unix socket pair; the test
//! holds the other end and decides when data arrives and when the body ends.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use konnect_core::{ResponseHead, TransferId};

use super::{
    Completion, MultiSession, NativeFailure, NewTransfer, RawSocket, Readiness, SocketInterest,
    SocketInterestSink, TimeoutSink,
};
use crate::handle::BodySink;

/// Error code reported for hosts the stub has no endpoint for.
pub(crate) const CODE_UNRESOLVED: i32 = 6;
/// Error code reported when the socket fails mid-transfer.
pub(crate) const CODE_RECV_ERROR: i32 = 56;

/// Engine call recorded by the stub, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubAction {
    Socket(RawSocket),
    Timeout,
}

#[derive(Debug)]
enum Endpoint {
    Serve {
        engine_side: UnixStream,
        head: ResponseHead,
    },
    Fail {
        code: i32,
        message: String,
    },
}

#[derive(Debug, Default)]
struct StubState {
    endpoints: HashMap<String, VecDeque<Endpoint>>,
    added: Vec<TransferId>,
    removed: Vec<TransferId>,
    actions: Vec<StubAction>,
    reject_next_add: Option<String>,
    released: bool,
}

/// Test-side handle onto a [`StubSession`].
#[derive(Debug, Clone, Default)]
pub(crate) struct StubControl {
    state: Arc<Mutex<StubState>>,
}

impl StubControl {
    /// Queue a served endpoint for the next transfer to `host`.
    ///
    /// Returns the peer end: bytes written to it become body chunks and closing it ends
    /// the transfer with `head`.
    pub(crate) fn endpoint(&self, host: &str, head: ResponseHead) -> Result<UnixStream> {
        let (engine_side, peer) = UnixStream::pair().context("failed to create socket pair")?;
        engine_side
            .set_nonblocking(true)
            .context("failed to make stub socket non-blocking")?;
        self.queue(host, Endpoint::Serve { engine_side, head });
        Ok(peer)
    }

    /// Queue an endpoint that fails the next transfer to `host` with `code`.
    pub(crate) fn failing_endpoint(&self, host: &str, code: i32, message: &str) {
        self.queue(
            host,
            Endpoint::Fail {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Make the next `add_transfer` call fail with `message`.
    pub(crate) fn reject_next_add(&self, message: &str) {
        self.lock().reject_next_add = Some(message.to_string());
    }

    pub(crate) fn added(&self) -> Vec<TransferId> {
        self.lock().added.clone()
    }

    pub(crate) fn removed(&self) -> Vec<TransferId> {
        self.lock().removed.clone()
    }

    pub(crate) fn actions(&self) -> Vec<StubAction> {
        self.lock().actions.clone()
    }

    pub(crate) fn clear_actions(&self) {
        self.lock().actions.clear();
    }

    /// Whether the session owning this control has been dropped.
    pub(crate) fn released(&self) -> bool {
        self.lock().released
    }

    fn queue(&self, host: &str, endpoint: Endpoint) {
        self.lock()
            .endpoints
            .entry(host.to_string())
            .or_default()
            .push_back(endpoint);
    }

    fn next_endpoint(&self, host: &str) -> Option<Endpoint> {
        self.lock().endpoints.get_mut(host)?.pop_front()
    }

    fn record(&self, action: StubAction) {
        self.lock().actions.push(action);
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct StubTransfer {
    id: TransferId,
    socket: UnixStream,
    head: ResponseHead,
    body: BodySink,
}

/// In-process engine that drives transfers from scripted endpoints.
pub(crate) struct StubSession {
    control: StubControl,
    sockets: Option<Arc<dyn SocketInterestSink>>,
    timer: Option<Arc<dyn TimeoutSink>>,
    running: HashMap<RawSocket, StubTransfer>,
    failing: VecDeque<Completion>,
    completions: Vec<Completion>,
    // Finished sockets stay open so descriptor numbers are never reused mid-session.
    retired: Vec<UnixStream>,
}

impl Default for StubSession {
    fn default() -> Self {
        Self::with_control(StubControl::default())
    }
}

impl StubSession {
    pub(crate) fn with_control(control: StubControl) -> Self {
        Self {
            control,
            sockets: None,
            timer: None,
            running: HashMap::new(),
            failing: VecDeque::new(),
            completions: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub(crate) fn control(&self) -> StubControl {
        self.control.clone()
    }

    fn sinks(&self) -> Result<(Arc<dyn SocketInterestSink>, Arc<dyn TimeoutSink>)> {
        match (&self.sockets, &self.timer) {
            (Some(sockets), Some(timer)) => Ok((Arc::clone(sockets), Arc::clone(timer))),
            _ => Err(anyhow!("stub session used before bind")),
        }
    }

    fn running_count(&self) -> usize {
        self.running.len() + self.failing.len()
    }

    fn finish(&mut self, socket: RawSocket, outcome: Result<(), NativeFailure>) -> Result<()> {
        let Some(transfer) = self.running.remove(&socket) else {
            return Ok(());
        };
        let (sockets, _) = self.sinks()?;
        sockets.socket_interest_changed(socket, SocketInterest::NONE);
        self.completions.push(Completion {
            id: transfer.id,
            outcome: outcome.map(|()| transfer.head),
        });
        self.retired.push(transfer.socket);
        Ok(())
    }

    fn pump(&mut self, socket: RawSocket) -> Result<()> {
        let Some(transfer) = self.running.get_mut(&socket) else {
            return Ok(());
        };
        let mut buf = [0_u8; 4096];
        let outcome = loop {
            match transfer.socket.read(&mut buf) {
                Ok(0) => break Some(Ok(())),
                Ok(read) => transfer.body.deliver(&buf[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break None,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    break Some(Err(NativeFailure {
                        code: CODE_RECV_ERROR,
                        message: err.to_string(),
                    }));
                }
            }
        };
        match outcome {
            Some(outcome) => self.finish(socket, outcome),
            None => Ok(()),
        }
    }
}

impl MultiSession for StubSession {
    fn bind(
        &mut self,
        sockets: Arc<dyn SocketInterestSink>,
        timer: Arc<dyn TimeoutSink>,
    ) -> Result<()> {
        self.sockets = Some(sockets);
        self.timer = Some(timer);
        Ok(())
    }

    fn add_transfer(&mut self, transfer: NewTransfer) -> Result<()> {
        let (sockets, timer) = self.sinks()?;
        if let Some(message) = self.control.lock().reject_next_add.take() {
            return Err(anyhow!(message)).context("stub refused transfer");
        }
        let host = transfer.url.host_str().unwrap_or_default().to_string();
        let endpoint = self.control.next_endpoint(&host);
        self.control.lock().added.push(transfer.id);

        match endpoint {
            Some(Endpoint::Serve { engine_side, head }) => {
                let socket = engine_side.as_raw_fd();
                sockets.socket_interest_changed(socket, SocketInterest::READ);
                self.running.insert(
                    socket,
                    StubTransfer {
                        id: transfer.id,
                        socket: engine_side,
                        head,
                        body: transfer.body,
                    },
                );
            }
            other => {
                let failure = match other {
                    Some(Endpoint::Fail { code, message }) => NativeFailure { code, message },
                    _ => NativeFailure {
                        code: CODE_UNRESOLVED,
                        message: format!("Could not resolve host: {host}"),
                    },
                };
                // Failures surface on the next timeout action, as a real resolver would.
                timer.timeout_requested(Some(Duration::ZERO));
                self.failing.push_back(Completion {
                    id: transfer.id,
                    outcome: Err(failure),
                });
            }
        }
        Ok(())
    }

    fn remove_transfer(&mut self, id: TransferId) -> Result<bool> {
        self.control.lock().removed.push(id);

        if let Some(index) = self.failing.iter().position(|pending| pending.id == id) {
            self.failing.remove(index);
            return Ok(true);
        }
        let socket = self
            .running
            .iter()
            .find_map(|(socket, transfer)| (transfer.id == id).then_some(*socket));
        let Some(socket) = socket else {
            return Ok(false);
        };
        if let Some(transfer) = self.running.remove(&socket) {
            let (sockets, _) = self.sinks()?;
            sockets.socket_interest_changed(socket, SocketInterest::NONE);
            self.retired.push(transfer.socket);
        }
        Ok(true)
    }

    fn socket_action(&mut self, socket: RawSocket, readiness: Readiness) -> Result<usize> {
        self.control.record(StubAction::Socket(socket));
        if readiness.error {
            self.finish(
                socket,
                Err(NativeFailure {
                    code: CODE_RECV_ERROR,
                    message: "Failure when receiving data from the peer".to_string(),
                }),
            )?;
        } else {
            self.pump(socket)?;
        }
        Ok(self.running_count())
    }

    fn timeout_action(&mut self) -> Result<usize> {
        self.control.record(StubAction::Timeout);
        self.completions.extend(self.failing.drain(..));
        Ok(self.running_count())
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }
}

impl Drop for StubSession {
    fn drop(&mut self) {
        self.control.lock().released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::body_channel;
    use crate::registry::{Registration, RegistrationQueue};
    use konnect_core::Request;
    use std::io::Write;

    fn bound() -> (StubSession, Arc<RegistrationQueue>) {
        let queue = Arc::new(RegistrationQueue::default());
        let mut session = StubSession::default();
        session
            .bind(queue.clone(), queue.clone())
            .expect("bind stub");
        (session, queue)
    }

    fn transfer(
        id: u64,
        target: &str,
    ) -> (NewTransfer, tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) {
        let request = Request::get(target);
        let url = request.validate().expect("valid request");
        let (body, rx) = body_channel();
        (
            NewTransfer {
                id: TransferId(id),
                url,
                request,
                body,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn served_transfer_streams_until_eof() -> anyhow::Result<()> {
        let (mut session, queue) = bound();
        let control = session.control();
        let mut peer = control.endpoint("a.test", ResponseHead::default())?;
        let (new, mut rx) = transfer(1, "http://a.test/");
        session.add_transfer(new)?;

        let socket = match queue.take().as_slice() {
            [Registration::Socket { socket, interest }] => {
                assert_eq!(*interest, SocketInterest::READ);
                *socket
            }
            other => panic!("unexpected registrations {other:?}"),
        };

        peer.write_all(b"chunk")?;
        assert_eq!(session.socket_action(socket, Readiness::default())?, 1);
        assert_eq!(rx.recv().await.as_deref(), Some(&b"chunk"[..]));
        assert!(session.drain_completions().is_empty());

        drop(peer);
        assert_eq!(session.socket_action(socket, Readiness::default())?, 0);
        let done = session.drain_completions();
        assert_eq!(done.len(), 1);
        assert!(done[0].outcome.is_ok());
        assert_eq!(
            queue.take(),
            vec![Registration::Socket {
                socket,
                interest: SocketInterest::NONE,
            }]
        );
        assert_eq!(
            control.actions(),
            vec![StubAction::Socket(socket), StubAction::Socket(socket)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_host_fails_on_timeout_action() -> anyhow::Result<()> {
        let (mut session, queue) = bound();
        let (new, _rx) = transfer(2, "http://nowhere.test/");
        session.add_transfer(new)?;
        assert!(matches!(
            queue.take().as_slice(),
            [Registration::Timeout(Some(_))]
        ));
        assert!(session.drain_completions().is_empty());

        session.timeout_action()?;
        let done = session.drain_completions();
        match &done[..] {
            [Completion { id, outcome: Err(failure) }] => {
                assert_eq!(*id, TransferId(2));
                assert_eq!(failure.code, CODE_UNRESOLVED);
            }
            other => panic!("unexpected completions {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn remove_reports_whether_transfer_was_known() -> anyhow::Result<()> {
        let (mut session, _queue) = bound();
        let control = session.control();
        control.failing_endpoint("b.test", 7, "refused");
        let (new, _rx) = transfer(3, "http://b.test/");
        session.add_transfer(new)?;

        assert!(session.remove_transfer(TransferId(3))?);
        assert!(!session.remove_transfer(TransferId(3))?);
        session.timeout_action()?;
        assert!(session.drain_completions().is_empty());
        assert_eq!(control.removed(), vec![TransferId(3), TransferId(3)]);
        Ok(())
    }

    #[test]
    fn unbound_session_rejects_transfers() {
        let mut session = StubSession::default();
        let (new, _rx) = transfer(4, "http://a.test/");
        assert!(session.add_transfer(new).is_err());
    }

    #[test]
    fn drop_marks_control_released() {
        let session = StubSession::default();
        let control = session.control();
        assert!(!control.released());
        drop(session);
        assert!(control.released());
    }
}
