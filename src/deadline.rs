//! The deadline-handle propagated through every externally visible
//! operation: a deadline instant plus a cancellation signal, threaded
//! through downloads, transcoder spawns, provider calls, and pool
//! submissions so that any of them can be aborted from outside.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A propagated deadline + cancellation signal. Cheap to clone; clones
/// share the same underlying cancellation token, so cancelling one
/// cancels every clone derived from it (and every [`Self::child`]).
#[derive(Clone)]
pub struct Deadline {
    deadline: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    /// A deadline `duration` from now, with its own cancellation token.
    pub fn after(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
            cancel: CancellationToken::new(),
        }
    }

    /// A deadline that never expires on its own; only external
    /// cancellation (via [`Self::cancel`]) can end it.
    pub fn never() -> Self {
        Self {
            deadline: Instant::now() + Duration::from_secs(60 * 60 * 24 * 365),
            cancel: CancellationToken::new(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signals cancellation to every clone of this handle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the deadline passes or cancellation is signalled,
    /// whichever comes first. Useful in a `tokio::select!` alongside the
    /// operation being bounded.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// A derived deadline for a sub-operation: expires at `min(self's
    /// remaining time, duration)`, and inherits this handle's
    /// cancellation (cancelling the parent cancels the child, but not
    /// vice versa — this mirrors a per-item deadline nested inside a
    /// caller-supplied overall one).
    pub fn child(&self, duration: Duration) -> Self {
        let bounded = self.remaining().min(duration);
        Self {
            deadline: Instant::now() + bounded,
            cancel: self.cancel.child_token(),
        }
    }

    /// Runs `fut` to completion unless the deadline expires or
    /// cancellation fires first, in which case `Err(())` is returned.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, DeadlineExceeded>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

/// Marker error returned by [`Deadline::run`] when time runs out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded;

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline exceeded")
    }
}

impl std::error::Error for DeadlineExceeded {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expires_after_duration() {
        let d = Deadline::after(Duration::from_millis(10));
        assert!(!d.is_expired());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(d.is_expired());
    }

    #[tokio::test]
    async fn cancel_marks_expired_immediately() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.is_expired());
        d.cancel();
        assert!(d.is_expired());
        assert!(d.is_cancelled());
    }

    #[tokio::test]
    async fn child_is_capped_by_parent_remaining() {
        let d = Deadline::after(Duration::from_millis(20));
        let child = d.child(Duration::from_secs(60));
        assert!(child.remaining() <= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_child() {
        let d = Deadline::after(Duration::from_secs(60));
        let child = d.child(Duration::from_secs(60));
        d.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn run_short_circuits_on_cancel() {
        let d = Deadline::after(Duration::from_secs(60));
        d.cancel();
        let result = d.run(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            42
        }).await;
        assert!(result.is_err());
    }
}
