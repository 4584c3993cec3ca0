//! Outgoing call timeout and delayed reset timers.
//!
//! Timers never touch the session themselves. On expiry they report a
//! [`TimerFired`] tagged with the generation they were armed under and the
//! engine decides whether it still applies.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OutgoingTimeout,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

pub type TimerNotify = Arc<dyn Fn(TimerFired) + Send + Sync>;

/// Owns at most one timer of each kind.
pub struct CallTimers {
    notify: TimerNotify,
    outgoing_timeout: Option<JoinHandle<()>>,
    reset: Option<JoinHandle<()>>,
}

impl CallTimers {
    pub fn new(notify: TimerNotify) -> Self {
        Self {
            notify,
            outgoing_timeout: None,
            reset: None,
        }
    }

    fn arm(&self, kind: TimerKind, generation: u64, after: Duration) -> JoinHandle<()> {
        let notify = self.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(target: "Call/Timer", "{kind:?} fired for generation {generation}");
            notify(TimerFired { kind, generation });
        })
    }

    /// Arms the outgoing timeout, replacing any previous one.
    pub fn start_outgoing_timeout(&mut self, generation: u64, after: Duration) {
        self.cancel_outgoing_timeout();
        self.outgoing_timeout = Some(self.arm(TimerKind::OutgoingTimeout, generation, after));
    }

    /// Returns whether a timeout was pending.
    pub fn cancel_outgoing_timeout(&mut self) -> bool {
        match self.outgoing_timeout.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn schedule_reset(&mut self, generation: u64, after: Duration) {
        if let Some(handle) = self.reset.take() {
            handle.abort();
        }
        self.reset = Some(self.arm(TimerKind::Reset, generation, after));
    }

    pub fn cancel_all(&mut self) {
        self.cancel_outgoing_timeout();
        if let Some(handle) = self.reset.take() {
            handle.abort();
        }
    }
}

impl Drop for CallTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
