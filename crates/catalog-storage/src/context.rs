//! Per-operation execution context.
//!
//! Every store and cache call takes a [`Context`] carrying a cancellation
//! token and an optional deadline. [`Context::run`] races the operation
//! against both, so a caller that gives up sees the operation return
//! promptly with a cancellation-kind error.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline.
///
/// Cloning shares the token: cancelling a clone cancels the original.
/// Use [`Context::child`] for a context that can be cancelled on its own.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Context {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A fresh context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Context {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context driven by an externally owned token.
    pub fn with_token(token: CancellationToken) -> Self {
        Context {
            token,
            deadline: None,
        }
    }

    /// Derives a context cancelled whenever `self` is, but which can also
    /// be cancelled independently.
    pub fn child(&self) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child whose deadline is the earlier of the parent's and
    /// `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let local = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < local => parent,
            _ => local,
        };
        Context {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns why the context is done, or `None` if it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the context is done, whichever is
    /// first. A context that is already done never polls `fut`.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ContextError>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err.into()),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_runs_to_completion() {
        let ctx = Context::background();
        let out: Result<u32, ContextError> = ctx.run(async { Ok(7) }).await;
        assert_eq!(out, Ok(7));
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = Context::background();
        ctx.cancel();
        let polled = std::sync::atomic::AtomicBool::new(false);
        let out: Result<(), ContextError> = ctx
            .run(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(out, Err(ContextError::Cancelled));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_pending_work() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        let out: Result<(), ContextError> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(out, Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn child_follows_parent_cancellation() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));

        let other = Context::background();
        let independent = other.child();
        independent.cancel();
        assert!(!other.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn child_with_timeout_keeps_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(5));
        assert_eq!(child.deadline(), parent.deadline());

        let loose = Context::background();
        let tight = loose.child_with_timeout(Duration::from_millis(10));
        assert!(tight.deadline().is_some());
    }
}
