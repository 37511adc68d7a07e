//! Cancellation context passed to every chain operation
//!
//! A `RequestContext` couples a cancellation token with an optional
//! deadline. Elements race their work against it through [`RequestContext::run`],
//! so a cancelled traversal returns promptly and the composer stops
//! invoking downstream elements.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped a running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The token was cancelled explicitly
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Cancellation and timeout scope for one externally visible operation
#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context that is never cancelled unless [`cancel`](Self::cancel) is called
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context bound to an existing cancellation token
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context that also expires after `timeout`
    ///
    /// The child keeps the earlier of the two deadlines and is cancelled
    /// when the parent is.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Deadline, if any
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check whether the context is already done
    #[must_use]
    pub fn interrupted(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Check whether the context is done for any reason
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.interrupted().is_some()
    }

    /// Run `fut` until it completes or the context is done
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if cancellation or the deadline wins the race.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        if let Some(reason) = self.interrupted() {
            return Err(reason);
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Err(Interrupted::Cancelled),
                    () = tokio::time::sleep_until(deadline) => Err(Interrupted::DeadlineExceeded),
                    out = fut => Ok(out),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Err(Interrupted::Cancelled),
                    out = fut => Ok(out),
                }
            }
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
