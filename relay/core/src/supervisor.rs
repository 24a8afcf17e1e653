//! Cancellation & Timeout Supervision
//!
//! Decides whether a session should stop. Two independent triggers feed it:
//!
//! - **Cancellation**: a [`CancelHandle`] held by the transport (client
//!   disconnect), the manager (explicit stop, shutdown) or the caller.
//! - **Timeout**: a fixed ceiling measured from session start. It applies no
//!   matter how well-behaved the client is, so a stalled upstream still ends
//!   the session.
//!
//! Cancellation is cooperative. The generator asks [`Supervisor::check`]
//! before each upstream pull and races [`Supervisor::stopped`] against the
//! pull itself; nothing is interrupted mid-step.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Default session ceiling
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest ceiling configuration accepts (one day)
pub const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Deadline used when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Why a cancellation was requested
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The transport saw the client go away
    ClientDisconnected,
    /// A caller asked for the stream to stop
    Requested,
    /// The host process is shutting down
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::Requested => write!(f, "stop requested"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Outcome the supervisor forces on a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Ends with a `cancelled` envelope
    Cancelled(CancelReason),
    /// Ends with a timeout `error` envelope
    TimedOut,
}

/// Clonable handle used to request cancellation of one session
///
/// The first reason delivered wins; later calls are ignored.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
}

impl CancelHandle {
    /// Request cancellation
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// A receiver-side view of this handle
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side of a cancellation channel
///
/// Handed to upstream pipelines so they can stop producing.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    /// Current cancellation reason, if any
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until cancellation is requested
    ///
    /// If every [`CancelHandle`] is dropped without cancelling, this never
    /// resolves: an orphaned session is bounded by its timeout instead.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected handle/signal pair
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// The "should-stop now" predicate for one session
#[derive(Debug)]
pub struct Supervisor {
    signal: CancelSignal,
    deadline: Instant,
    timeout: Duration,
}

impl Supervisor {
    /// Start supervising with the ceiling measured from now
    ///
    /// A ceiling too large to represent is treated as "effectively never".
    #[must_use]
    pub fn new(signal: CancelSignal, timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self {
            signal,
            deadline,
            timeout,
        }
    }

    /// Configured ceiling
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the ceiling
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Should the session stop now?
    ///
    /// Cancellation takes precedence over a timeout that elapsed at the
    /// same moment.
    #[must_use]
    pub fn check(&self) -> Option<StopReason> {
        if let Some(reason) = self.signal.reason() {
            return Some(StopReason::Cancelled(reason));
        }
        if Instant::now() >= self.deadline {
            return Some(StopReason::TimedOut);
        }
        None
    }

    /// Wait until the session must stop
    pub async fn stopped(&mut self) -> StopReason {
        tokio::select! {
            biased;
            reason = self.signal.cancelled() => StopReason::Cancelled(reason),
            () = tokio::time::sleep_until(self.deadline) => StopReason::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let (handle, signal) = cancel_pair();
        assert!(!handle.is_cancelled());

        handle.cancel(CancelReason::ClientDisconnected);
        handle.cancel(CancelReason::Shutdown);

        assert!(handle.is_cancelled());
        assert_eq!(signal.reason(), Some(CancelReason::ClientDisconnected));
    }

    #[test]
    fn test_cloned_handles_share_state() {
        let (handle, signal) = cancel_pair();
        let other = handle.clone();
        other.cancel(CancelReason::Requested);
        assert!(handle.is_cancelled());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_check_reports_cancellation() {
        let (handle, signal) = cancel_pair();
        let supervisor = Supervisor::new(signal, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(supervisor.check(), None);

        handle.cancel(CancelReason::Requested);
        assert_eq!(
            supervisor.check(),
            Some(StopReason::Cancelled(CancelReason::Requested))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reports_timeout() {
        let (_handle, signal) = cancel_pair();
        let supervisor = Supervisor::new(signal, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(supervisor.check(), None);
        assert_eq!(supervisor.remaining(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(supervisor.check(), Some(StopReason::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_never_fires() {
        let (_handle, signal) = cancel_pair();
        let supervisor = Supervisor::new(signal, Duration::MAX);

        tokio::time::advance(Duration::from_secs(365 * 86_400)).await;
        assert_eq!(supervisor.check(), None);
        assert!(supervisor.remaining() > Duration::from_secs(86_400));
        assert_eq!(supervisor.timeout(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_resolves_on_deadline() {
        let (_handle, signal) = cancel_pair();
        let mut supervisor = Supervisor::new(signal, Duration::from_secs(30));

        let start = Instant::now();
        assert_eq!(supervisor.stopped().await, StopReason::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_cancel() {
        let (handle, signal) = cancel_pair();
        let mut supervisor = Supervisor::new(signal, DEFAULT_SESSION_TIMEOUT);

        let waiter = tokio::spawn(async move { supervisor.stopped().await });
        handle.cancel(CancelReason::ClientDisconnected);

        assert_eq!(
            waiter.await.unwrap(),
            StopReason::Cancelled(CancelReason::ClientDisconnected)
        );
    }

    #[test]
    fn test_cancelled_pending_until_cancel() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let (handle, mut signal) = cancel_pair();
        let mut waiter = task::spawn(signal.cancelled());
        assert_pending!(waiter.poll());

        handle.cancel(CancelReason::Shutdown);
        assert!(waiter.is_woken());
        assert_ready_eq!(waiter.poll(), CancelReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_falls_back_to_timeout() {
        let (handle, signal) = cancel_pair();
        let mut supervisor = Supervisor::new(signal, Duration::from_secs(5));
        drop(handle);

        assert_eq!(supervisor.stopped().await, StopReason::TimedOut);
    }
}
