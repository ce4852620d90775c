use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// How an outstanding [`TimerDriver::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerOutcome {
    /// The deadline the wait started with passed and was consumed.
    Fired,
    /// The deadline was replaced, cancelled, or consumed elsewhere first.
    Superseded,
}

#[derive(Debug, Clone, Copy, Default)]
struct Deadline {
    at: Option<Instant>,
    generation: u64,
}

/// Single-shot deadline the engine asks to be woken at.
///
/// Arming replaces any previous deadline and cancels waits on it; a deadline fires at
/// most once and stays cleared until the engine asks again.
#[derive(Debug)]
pub(crate) struct TimerDriver {
    state: watch::Sender<Deadline>,
}

impl Default for TimerDriver {
    fn default() -> Self {
        Self {
            state: watch::Sender::new(Deadline::default()),
        }
    }
}

impl TimerDriver {
    /// Replace the deadline; `None` cancels it.
    pub(crate) fn arm(&self, at: Option<Instant>) {
        self.state.send_modify(|deadline| {
            deadline.at = at;
            deadline.generation += 1;
        });
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.state.borrow().at
    }

    /// Consume the deadline when it is already due at `now`.
    pub(crate) fn take_if_due(&self, now: Instant) -> bool {
        self.state.send_if_modified(|deadline| match deadline.at {
            Some(at) if at <= now => {
                deadline.at = None;
                deadline.generation += 1;
                true
            }
            _ => false,
        })
    }

    /// Wait for the current deadline.
    ///
    /// While unarmed this resolves as [`TimerOutcome::Superseded`] on the next `arm`.
    pub(crate) async fn wait(&self) -> TimerOutcome {
        let mut changes = self.state.subscribe();
        let Deadline { at, generation } = *changes.borrow_and_update();
        let Some(at) = at else {
            let _ = changes.changed().await;
            return TimerOutcome::Superseded;
        };

        tokio::select! {
            () = sleep_until(at) => {
                let fired = self.state.send_if_modified(|deadline| {
                    if deadline.generation != generation {
                        return false;
                    }
                    deadline.at = None;
                    deadline.generation += 1;
                    true
                });
                if fired {
                    TimerOutcome::Fired
                } else {
                    TimerOutcome::Superseded
                }
            }
            _ = changes.changed() => TimerOutcome::Superseded,
        }
    }
}
