use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;
use tracing::debug;

use crate::cancel::CancellationToken;

/// Process-wide exclusive flag answering "is any debug session open".
///
/// Owned by whoever builds the debug module and shared by every facade that
/// must not run concurrently with another.
#[derive(Debug, Default)]
pub struct SessionGuard {
    active: AtomicBool,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the caller now owns the session.
    pub fn try_acquire(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// How a wait for the IDE ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The IDE sent `ReadyReq` (now or earlier in the session).
    Ready,
    Cancelled,
    TimedOut,
    /// The session was closed while waiting.
    Closed,
    /// Another thread is already waiting; this call did not block.
    AlreadyWaiting,
}

#[derive(Debug, Default)]
struct SyncState {
    waiting: bool,
    ready: bool,
    closed: bool,
}

/// Rendezvous between an interpreter thread and IDE readiness.
#[derive(Debug)]
pub struct SessionSynchronizer {
    state: Mutex<SyncState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    wake_interval: Duration,
}

impl SessionSynchronizer {
    pub fn new(wake_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        Self {
            state: Mutex::new(SyncState::default()),
            wake_tx,
            wake_rx,
            wake_interval,
        }
    }

    /// Blocks until the IDE is ready, `cancel` fires, the session closes or
    /// `timeout` elapses.
    ///
    /// Cancellation is observed within one wake interval at worst: the token's
    /// channel wakes the waiter directly and a ticker re-checks the flags on
    /// every interval regardless.
    pub fn wait_for_ready(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        {
            let mut state = self.state.lock();
            if state.ready {
                return WaitOutcome::Ready;
            }
            if state.closed {
                return WaitOutcome::Closed;
            }
            if state.waiting {
                return WaitOutcome::AlreadyWaiting;
            }
            state.waiting = true;
        }
        let _waiting = scopeguard::guard((), |_| self.state.lock().waiting = false);

        while self.wake_rx.try_recv().is_ok() {}

        let ticker = crossbeam_channel::tick(self.wake_interval);
        let deadline = timeout
            .map(crossbeam_channel::after)
            .unwrap_or_else(crossbeam_channel::never);

        debug!(interval = ?self.wake_interval, "Waiting for IDE");
        loop {
            select! {
                recv(self.wake_rx) -> _ => {},
                recv(cancel.receiver()) -> _ => {},
                recv(ticker) -> _ => {},
                recv(deadline) -> _ => return WaitOutcome::TimedOut,
            }

            let state = self.state.lock();
            if state.ready {
                return WaitOutcome::Ready;
            }
            if state.closed {
                return WaitOutcome::Closed;
            }
            if cancel.is_cancelled() {
                debug!("Wait for IDE cancelled");
                return WaitOutcome::Cancelled;
            }
        }
    }

    /// Marks the IDE ready for the rest of the session and wakes the waiter.
    pub fn mark_ready(&self) {
        self.state.lock().ready = true;
        let _ = self.wake_tx.send(());
    }

    /// Wakes the waiter with `Closed` and makes later waits return immediately.
    pub fn close(&self) {
        self.state.lock().closed = true;
        let _ = self.wake_tx.send(());
    }

    /// Clears readiness so the synchronizer can serve a new session.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.ready = false;
        state.closed = false;
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }
}
