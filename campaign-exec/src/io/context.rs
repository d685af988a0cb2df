//! Deadline and cancellation scope for blocking work.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Interrupted;

/// Carries an optional deadline and a cancellation token down to every
/// subprocess a task spawns.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    /// Context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context: cancelled with `self`, expiring at the earlier of the
    /// parent deadline and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Fresh context with only a timeout, independent of any parent. Used for
    /// cleanup that must run even after the task's own context expired.
    pub fn detached(timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Why this context is done, if it is.
    pub fn err(&self) -> Option<Interrupted> {
        if self.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        if self.deadline_exceeded() {
            return Some(Interrupted::DeadlineExceeded);
        }
        None
    }

    /// Drive `fut` until it completes or the context is done. Dropping `fut`
    /// on interruption is how child processes get killed (`kill_on_drop`).
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_completes_before_deadline() {
        let ctx = RunContext::background().with_timeout(Duration::from_secs(5));
        let out = ctx.run(async { 7 }).await.expect("run");
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn run_reports_deadline_exceeded() {
        let ctx = RunContext::background().with_timeout(Duration::from_millis(20));
        let err = ctx.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, Interrupted::DeadlineExceeded);
        assert!(ctx.deadline_exceeded());
    }

    #[tokio::test]
    async fn child_is_cancelled_with_parent() {
        let parent = RunContext::background();
        let child = parent.with_timeout(Duration::from_secs(5));
        parent.cancel();
        assert_eq!(child.err(), Some(Interrupted::Cancelled));
        let err = child.sleep(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, Interrupted::Cancelled);
    }

    #[tokio::test]
    async fn child_keeps_earlier_parent_deadline() {
        let parent = RunContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn detached_ignores_cancelled_parent() {
        let parent = RunContext::background();
        parent.cancel();
        let cleanup = RunContext::detached(Duration::from_secs(1));
        assert!(parent.is_cancelled());
        assert!(cleanup.err().is_none());
    }
}
