use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::session::{RawSocket, SocketInterest, SocketInterestSink, TimeoutSink};

/// A request the engine raised from inside one of its calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    Socket {
        socket: RawSocket,
        interest: SocketInterest,
    },
    /// Absolute deadline, or `None` to cancel the timer.
    Timeout(Option<Instant>),
}

/// Collects engine callbacks in arrival order until the bridge applies them.
#[derive(Debug, Default)]
pub(crate) struct RegistrationQueue {
    pending: Mutex<VecDeque<Registration>>,
}

impl RegistrationQueue {
    pub(crate) fn take(&self) -> Vec<Registration> {
        self.lock().drain(..).collect()
    }

    fn push(&self, registration: Registration) {
        self.lock().push_back(registration);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Registration>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SocketInterestSink for RegistrationQueue {
    fn socket_interest_changed(&self, socket: RawSocket, interest: SocketInterest) {
        self.push(Registration::Socket { socket, interest });
    }
}

impl TimeoutSink for RegistrationQueue {
    fn timeout_requested(&self, delay: Option<Duration>) {
        self.push(Registration::Timeout(delay.map(|delay| Instant::now() + delay)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn callbacks_are_kept_in_arrival_order() {
        let queue = RegistrationQueue::default();
        let now = Instant::now();
        queue.timeout_requested(Some(Duration::from_millis(250)));
        queue.socket_interest_changed(5, SocketInterest::READ);
        queue.timeout_requested(None);

        let taken = queue.take();
        assert_eq!(
            taken,
            vec![
                Registration::Timeout(Some(now + Duration::from_millis(250))),
                Registration::Socket {
                    socket: 5,
                    interest: SocketInterest::READ,
                },
                Registration::Timeout(None),
            ]
        );
        assert!(queue.take().is_empty());
    }
}
