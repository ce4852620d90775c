//! Readiness waits for sockets owned by the engine.
//!
//! # Design
//!
//! - One entry per socket; a new interest replaces (and deregisters) the old wait.
//! - Each installed wait delivers at most one readiness event. The entry is then spent
//!   and re-registered by [`SocketWaitSet::rearm`] before the next wait, so level state
//!   left behind by the engine is reported again instead of being lost to edge
//!   triggering.
//! - The descriptors belong to the engine and are never closed here.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::task::{Context, Poll};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::session::{RawSocket, Readiness, SocketInterest};

/// Borrowed descriptor; dropping it leaves the socket open.
#[derive(Debug)]
struct ExternalSocket(RawFd);

impl AsRawFd for ExternalSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[derive(Debug)]
struct SocketWatch {
    interest: SocketInterest,
    /// `None` once the wait has delivered its event.
    registration: Option<AsyncFd<ExternalSocket>>,
}

/// Readiness observed for one watched socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketReady {
    pub(crate) socket: RawSocket,
    pub(crate) readiness: Readiness,
}

#[derive(Debug, Default)]
pub(crate) struct SocketWaitSet {
    entries: HashMap<RawSocket, SocketWatch>,
}

impl SocketWaitSet {
    /// Install or replace the wait for `socket`.
    ///
    /// Watching with the interest already installed is a no-op. An empty interest is
    /// treated as [`SocketWaitSet::unwatch`].
    pub(crate) fn watch(&mut self, socket: RawSocket, interest: SocketInterest) -> io::Result<()> {
        if interest.is_none() {
            self.unwatch(socket);
            return Ok(());
        }
        if self
            .entries
            .get(&socket)
            .is_some_and(|watch| watch.interest == interest)
        {
            return Ok(());
        }

        // The previous registration must be gone before the descriptor is added again.
        self.entries.remove(&socket);
        let registration = register(socket, interest)?;
        self.entries.insert(
            socket,
            SocketWatch {
                interest,
                registration: Some(registration),
            },
        );
        Ok(())
    }

    /// Remove the wait for `socket`; returns whether one existed.
    pub(crate) fn unwatch(&mut self, socket: RawSocket) -> bool {
        self.entries.remove(&socket).is_some()
    }

    pub(crate) fn is_watching(&self, socket: RawSocket) -> bool {
        self.entries.contains_key(&socket)
    }

    #[cfg(test)]
    pub(crate) fn interest(&self, socket: RawSocket) -> Option<SocketInterest> {
        self.entries.get(&socket).map(|watch| watch.interest)
    }

    #[cfg(test)]
    pub(crate) fn watched(&self) -> Vec<RawSocket> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Re-register every spent entry. Sockets that can no longer be registered are
    /// dropped from the set and returned with the reactor error.
    pub(crate) fn rearm(&mut self) -> Vec<(RawSocket, io::Error)> {
        let mut failed = Vec::new();
        for (socket, watch) in &mut self.entries {
            if watch.registration.is_some() {
                continue;
            }
            match register(*socket, watch.interest) {
                Ok(registration) => watch.registration = Some(registration),
                Err(err) => failed.push((*socket, err)),
            }
        }
        for (socket, _) in &failed {
            self.entries.remove(socket);
        }
        failed
    }

    /// Collect every armed socket that is ready now, spending their waits.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<SocketReady>> {
        let mut ready = Vec::new();
        for (socket, watch) in &mut self.entries {
            let Some(registration) = watch.registration.as_ref() else {
                continue;
            };
            let mut readiness = Readiness::default();
            if watch.interest.readable {
                match registration.poll_read_ready(cx) {
                    Poll::Ready(Ok(_)) => readiness.readable = true,
                    Poll::Ready(Err(_)) => readiness.error = true,
                    Poll::Pending => {}
                }
            }
            if watch.interest.writable {
                match registration.poll_write_ready(cx) {
                    Poll::Ready(Ok(_)) => readiness.writable = true,
                    Poll::Ready(Err(_)) => readiness.error = true,
                    Poll::Pending => {}
                }
            }
            if !readiness.is_empty() {
                watch.registration = None;
                ready.push(SocketReady {
                    socket: *socket,
                    readiness,
                });
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    /// Suspend until at least one watched socket is ready. Pends forever when empty.
    pub(crate) async fn ready(&mut self) -> Vec<SocketReady> {
        std::future::poll_fn(|cx| self.poll_ready(cx)).await
    }
}

fn register(socket: RawSocket, interest: SocketInterest) -> io::Result<AsyncFd<ExternalSocket>> {
    let interest = match (interest.readable, interest.writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    };
    AsyncFd::with_interest(ExternalSocket(socket), interest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::task::Waker;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair() -> (UnixStream, UnixStream) {
        let (left, right) = UnixStream::pair().expect("socket pair");
        left.set_nonblocking(true).expect("nonblocking");
        right.set_nonblocking(true).expect("nonblocking");
        (left, right)
    }

    fn poll_now(set: &mut SocketWaitSet) -> Option<Vec<SocketReady>> {
        let mut cx = Context::from_waker(Waker::noop());
        match set.poll_ready(&mut cx) {
            Poll::Ready(ready) => Some(ready),
            Poll::Pending => None,
        }
    }

    #[tokio::test]
    async fn readable_socket_wakes_waiter() -> anyhow::Result<()> {
        let (engine, mut peer) = pair();
        let mut set = SocketWaitSet::default();
        set.watch(engine.as_raw_fd(), SocketInterest::READ)?;

        peer.write_all(b"ping")?;
        let ready = timeout(Duration::from_secs(1), set.ready()).await?;
        assert_eq!(
            ready,
            vec![SocketReady {
                socket: engine.as_raw_fd(),
                readiness: Readiness {
                    readable: true,
                    ..Readiness::default()
                },
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn identical_watch_keeps_single_entry() -> anyhow::Result<()> {
        let (engine, _peer) = pair();
        let mut set = SocketWaitSet::default();
        set.watch(engine.as_raw_fd(), SocketInterest::READ)?;
        set.watch(engine.as_raw_fd(), SocketInterest::READ)?;
        assert_eq!(set.len(), 1);
        assert_eq!(set.interest(engine.as_raw_fd()), Some(SocketInterest::READ));
        Ok(())
    }

    #[tokio::test]
    async fn replacing_interest_swaps_the_wait() -> anyhow::Result<()> {
        let (engine, _peer) = pair();
        let mut set = SocketWaitSet::default();
        set.watch(engine.as_raw_fd(), SocketInterest::READ)?;
        assert!(poll_now(&mut set).is_none(), "nothing to read yet");

        // An idle stream socket is writable straight away.
        set.watch(engine.as_raw_fd(), SocketInterest::WRITE)?;
        assert_eq!(set.len(), 1);
        let ready = timeout(Duration::from_secs(1), set.ready()).await?;
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readiness.writable);
        assert!(!ready[0].readiness.readable);
        Ok(())
    }

    #[tokio::test]
    async fn each_installation_delivers_once_until_rearmed() -> anyhow::Result<()> {
        let (mut engine, mut peer) = pair();
        let mut set = SocketWaitSet::default();
        set.watch(engine.as_raw_fd(), SocketInterest::READ)?;
        peer.write_all(b"data")?;

        let first = timeout(Duration::from_secs(1), set.ready()).await?;
        assert_eq!(first.len(), 1);
        assert!(poll_now(&mut set).is_none(), "spent wait must not fire twice");

        // Unread data is reported again once the wait is re-armed.
        assert!(set.rearm().is_empty());
        let again = timeout(Duration::from_secs(1), set.ready()).await?;
        assert_eq!(again.len(), 1);

        let mut buf = [0_u8; 16];
        let read = engine.read(&mut buf)?;
        assert_eq!(&buf[..read], b"data");
        assert!(set.rearm().is_empty());
        assert!(poll_now(&mut set).is_none(), "drained socket is not readable");
        Ok(())
    }

    #[tokio::test]
    async fn unwatch_is_a_no_op_for_unknown_sockets() -> anyhow::Result<()> {
        let (engine, mut peer) = pair();
        let mut set = SocketWaitSet::default();
        assert!(!set.unwatch(engine.as_raw_fd()));

        set.watch(engine.as_raw_fd(), SocketInterest::READ)?;
        assert!(set.unwatch(engine.as_raw_fd()));
        peer.write_all(b"late")?;
        assert!(poll_now(&mut set).is_none());
        assert_eq!(set.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_interest_removes_the_entry() -> anyhow::Result<()> {
        let (engine, _peer) = pair();
        let mut set = SocketWaitSet::default();
        set.watch(engine.as_raw_fd(), SocketInterest::BOTH)?;
        set.watch(engine.as_raw_fd(), SocketInterest::NONE)?;
        assert!(!set.is_watching(engine.as_raw_fd()));
        Ok(())
    }

    #[tokio::test]
    async fn empty_set_never_becomes_ready() {
        let mut set = SocketWaitSet::default();
        assert!(
            timeout(Duration::from_millis(20), set.ready())
                .await
                .is_err()
        );
    }
}
