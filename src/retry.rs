//! Request contexts and bounded polling
//!
//! Every inbound call gets a [`RequestContext`] carrying a cancellation
//! token and an optional deadline. Backend calls and [`RetryPolicy`] polls
//! observe both, so a caller-side timeout aborts the work it started.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Request Context
// =============================================================================

/// Cancellation and deadline scope of one inbound call
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context cancelled whenever `parent` is
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            deadline: None,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline; an earlier existing deadline wins
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the call is already cancelled or out of time
    pub fn check(&self, what: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(what.to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded(what.to_string()));
            }
        }
        Ok(())
    }

    /// Run a backend call bounded by this context
    pub async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(what)?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::Cancelled(what.to_string())),
                res = tokio::time::timeout_at(deadline, fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::DeadlineExceeded(what.to_string())),
                },
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::Cancelled(what.to_string())),
                res = fut => res,
            },
        }
    }

    /// Sleep unless the context ends first
    pub async fn sleep(&self, what: &str, delay: Duration) -> Result<()> {
        self.call(what, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Outcome of a single poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Retry,
}

/// Fixed-interval bounded polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy that tries exactly once
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `attempt` until it reports [`Attempt::Done`], returns an error,
    /// the attempts run out (`Ok(None)`) or the context ends
    pub async fn poll<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        what: &str,
        mut attempt: F,
    ) -> Result<Option<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let attempts = self.max_attempts.max(1);
        for n in 0..attempts {
            ctx.check(what)?;
            if let Attempt::Done(value) = attempt(n).await? {
                return Ok(Some(value));
            }
            if n + 1 < attempts {
                ctx.sleep(what, self.delay).await?;
            }
        }
        debug!(what, attempts, "poll exhausted");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_poll_succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let ctx = RequestContext::background();

        let got = policy
            .poll(&ctx, "test", |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n == 2 { Attempt::Done(n) } else { Attempt::Retry }) }
            })
            .await
            .unwrap();

        assert_eq!(got, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_exhausts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let got: Option<()> = policy
            .poll(&RequestContext::background(), "test", |_| async {
                Ok(Attempt::Retry)
            })
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_poll_propagates_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let res: Result<Option<()>> = policy
            .poll(&RequestContext::background(), "test", |_| async {
                Err(Error::Internal("boom".into()))
            })
            .await;
        assert_matches!(res, Err(Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_poll() {
        let ctx = RequestContext::background();
        ctx.cancel();
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        let res: Result<Option<()>> = policy
            .poll(&ctx, "test", |_| async { Ok(Attempt::Retry) })
            .await;
        assert_matches!(res, Err(Error::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_poll() {
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));
        let policy = RetryPolicy::new(20, Duration::from_secs(1));
        let res: Result<Option<()>> = policy
            .poll(&ctx, "device", |_| async { Ok(Attempt::Retry) })
            .await;
        assert_matches!(res, Err(Error::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = RequestContext::background()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_child_context_follows_parent() {
        let parent = CancellationToken::new();
        let ctx = RequestContext::child_of(&parent);
        parent.cancel();
        assert_matches!(ctx.check("x"), Err(Error::Cancelled(_)));
    }
}
