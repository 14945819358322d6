//! Session lifecycle shared between the async sink and the codec thread.

use std::{
    fmt,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
};

use crate::{error::FlacError, progress::ProgressTracker};

/// Lifecycle of a codec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Active,
    Draining,
    Finished,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Failed)
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Uninitialized, Initializing) => true,
            (Initializing, Active) => true,
            (Active, Draining) => true,
            (Active | Draining, Finished) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Finished => "finished",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Acknowledgement of a write into a decoder sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The chunk was queued and the queue is almost empty again.
    Accepted,
    /// The codec reached the end of the stream; later input is ignored.
    Finished,
}

/// State visible from both sides of a session.
#[derive(Debug)]
pub(crate) struct SessionShared {
    role: &'static str,
    state: Mutex<SessionState>,
    destroyed: AtomicBool,
    cancel: watch::Sender<bool>,
    pub tracker: ProgressTracker,
}

impl SessionShared {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            state: Mutex::new(SessionState::Uninitialized),
            destroyed: AtomicBool::new(false),
            cancel: watch::Sender::new(false),
            tracker: ProgressTracker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.lock()
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&self, next: SessionState) -> Result<(), FlacError> {
        let mut state = self.lock();
        if !state.can_become(next) {
            return Err(FlacError::Protocol(format!(
                "{} session cannot go from {} to {}",
                self.role, *state, next
            )));
        }
        tracing::debug!(role = self.role, from = %*state, to = %next, "session state change");
        *state = next;
        Ok(())
    }

    /// Marks the session failed unless it already reached a terminal state.
    pub fn fail(&self) {
        let mut state = self.lock();
        if !state.is_terminal() {
            tracing::debug!(role = self.role, from = %*state, "session failed");
            *state = SessionState::Failed;
        }
    }

    /// Flags the session as destroyed. Returns true for the first caller only.
    pub fn mark_destroyed(&self) -> bool {
        let first = !self.destroyed.swap(true, Ordering::AcqRel);
        if first {
            // Wakes a codec thread parked in `send_from_codec`.
            self.cancel.send_replace(true);
        }
        first
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Sends from the codec thread into a bounded channel.
    ///
    /// Waits for capacity like `blocking_send`, but gives up as soon as the
    /// session is destroyed, so a consumer that stopped reading cannot pin
    /// the codec thread.
    pub fn send_from_codec<T>(&self, tx: &mpsc::Sender<T>, value: T) -> SendOutcome {
        let value = match tx.try_send(value) {
            Ok(()) => return SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Closed(_)) => return SendOutcome::Closed,
            Err(mpsc::error::TrySendError::Full(value)) => value,
        };
        if self.is_destroyed() {
            return SendOutcome::Cancelled;
        }
        let mut cancel = self.cancel.subscribe();
        let Ok(runtime) = Handle::try_current() else {
            return match tx.blocking_send(value) {
                Ok(()) => SendOutcome::Sent,
                Err(_) => SendOutcome::Closed,
            };
        };
        runtime.block_on(async move {
            tokio::select! {
                sent = tx.send(value) => match sent {
                    Ok(()) => SendOutcome::Sent,
                    Err(_) => SendOutcome::Closed,
                },
                _ = cancel.wait_for(|destroyed| *destroyed) => SendOutcome::Cancelled,
            }
        })
    }
}

/// Result of [`SessionShared::send_from_codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Sent,
    /// The receiver was dropped.
    Closed,
    /// The session was destroyed while waiting for capacity.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_lifecycle() {
        let shared = SessionShared::new("test");
        assert_eq!(shared.state(), SessionState::Uninitialized);
        shared.advance(SessionState::Initializing).unwrap();
        shared.advance(SessionState::Active).unwrap();
        shared.advance(SessionState::Draining).unwrap();
        shared.advance(SessionState::Finished).unwrap();
        assert!(shared.state().is_terminal());
    }

    #[test]
    fn rejects_illegal_transitions() {
        let shared = SessionShared::new("test");
        assert!(matches!(
            shared.advance(SessionState::Active),
            Err(FlacError::Protocol(_))
        ));
        shared.advance(SessionState::Initializing).unwrap();
        shared.advance(SessionState::Failed).unwrap();
        assert!(shared.advance(SessionState::Failed).is_err());
        shared.fail();
        assert_eq!(shared.state(), SessionState::Failed);
    }

    #[test]
    fn destroy_flag_is_observed_once() {
        let shared = SessionShared::new("test");
        assert!(shared.mark_destroyed());
        assert!(!shared.mark_destroyed());
        assert!(shared.is_destroyed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroy_cancels_a_send_waiting_for_capacity() {
        let shared = std::sync::Arc::new(SessionShared::new("test"));
        let (tx, _rx) = mpsc::channel::<u32>(1);
        tx.try_send(0).unwrap();

        let codec = {
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || shared.send_from_codec(&tx, 1))
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!codec.is_finished());

        shared.mark_destroyed();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), codec)
            .await
            .expect("destroy must release the waiting sender")
            .unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled);
    }

    #[tokio::test]
    async fn send_reports_a_dropped_receiver() {
        let shared = SessionShared::new("test");
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        assert_eq!(shared.send_from_codec(&tx, 1), SendOutcome::Closed);
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        assert_eq!(shared.send_from_codec(&tx, 7), SendOutcome::Sent);
        assert_eq!(rx.recv().await, Some(7));
    }
}
