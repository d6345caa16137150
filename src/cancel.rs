//! Hierarchical cancellation tokens.
//!
//! A [`CancelToken`] is a node in a tree of stop signals. Cancelling a node
//! cancels every node derived from it; cancelling a child leaves its parent
//! untouched. A token may carry a deadline, in which case it cancels itself
//! with [`CancelCause::DeadlineExceeded`] once the deadline passes. There is no
//! separate timeout mechanism.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

/// Why a token was cancelled.
#[derive(Debug, Clone)]
pub enum CancelCause {
    /// Cancelled without a reason
    Requested,
    /// Cancelled with a caller-supplied reason
    Reason(String),
    /// The token's deadline (or an ancestor's) passed
    DeadlineExceeded,
    /// A fail-fast unit aborted the surrounding scope
    Failed(Arc<Error>),
}

impl CancelCause {
    pub fn reason<S: Into<String>>(reason: S) -> Self {
        CancelCause::Reason(reason.into())
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Requested => write!(f, "cancellation requested"),
            CancelCause::Reason(reason) => write!(f, "{}", reason),
            CancelCause::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelCause::Failed(err) => write!(f, "aborted after failure: {}", err),
        }
    }
}

struct Node {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<CancelCause>,
    parent: Option<Arc<Node>>,
}

impl Node {
    fn effective_deadline(&self) -> Option<Instant> {
        let parent = self.parent.as_ref().and_then(|p| p.effective_deadline());
        match (self.deadline, parent) {
            (Some(own), Some(inherited)) => Some(own.min(inherited)),
            (own, inherited) => own.or(inherited),
        }
    }
}

/// A cloneable handle onto a node in a cancellation tree.
///
/// Clones share the same node. Use [`CancelToken::derive`] to create a child.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

impl CancelToken {
    /// Create a root token with no deadline.
    pub fn new() -> Self {
        Self::root(None)
    }

    /// Create a root token that cancels itself at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::root(Some(deadline))
    }

    /// Create a root token that cancels itself after `timeout`. A timeout too
    /// large to represent means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::root(Instant::now().checked_add(timeout))
    }

    fn root(deadline: Option<Instant>) -> Self {
        Self {
            node: Arc::new(Node {
                token: CancellationToken::new(),
                deadline,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child token. The child observes this token's cancellation and
    /// deadline, but cancelling the child does not affect this token.
    pub fn derive(&self) -> Self {
        self.child(None)
    }

    /// Derive a child token with its own deadline. The child's effective
    /// deadline is the earlier of `deadline` and this token's.
    pub fn derive_with_deadline(&self, deadline: Instant) -> Self {
        self.child(Some(deadline))
    }

    /// Derive a child token that expires after `timeout`.
    pub fn derive_with_timeout(&self, timeout: Duration) -> Self {
        self.child(Instant::now().checked_add(timeout))
    }

    fn child(&self, deadline: Option<Instant>) -> Self {
        Self {
            node: Arc::new(Node {
                token: self.node.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(self.node.clone()),
            }),
        }
    }

    /// Cancel this token and all of its descendants.
    pub fn cancel(&self) {
        self.cancel_with(CancelCause::Requested);
    }

    /// Cancel with an explicit cause. Cancelling an already cancelled token is
    /// a no-op and keeps the first cause.
    pub fn cancel_with(&self, cause: CancelCause) {
        if self.node.token.is_cancelled() {
            return;
        }
        let _ = self.node.cause.set(cause);
        self.node.token.cancel();
    }

    /// True once this token or any ancestor has been cancelled, or the
    /// effective deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if self.node.token.is_cancelled() {
            return true;
        }
        match self.node.effective_deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                self.expire();
                true
            }
            _ => false,
        }
    }

    /// Wait until the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.node.effective_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = self.node.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => self.expire(),
                }
            }
            None => self.node.token.cancelled().await,
        }
    }

    /// The effective deadline, if this token or an ancestor has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.node.effective_deadline()
    }

    /// The cause recorded on the nearest cancelled node, or `None` while the
    /// token is live.
    pub fn cause(&self) -> Option<CancelCause> {
        if !self.is_cancelled() {
            return None;
        }
        let mut node = Some(&self.node);
        while let Some(current) = node {
            if let Some(cause) = current.cause.get() {
                return Some(cause.clone());
            }
            node = current.parent.as_ref();
        }
        // Cancelled through a drop guard, which records no cause.
        Some(CancelCause::Requested)
    }

    /// Returns a guard that cancels this token when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        self.node.token.clone().drop_guard()
    }

    /// The error a unit reports when it stops because this token fired.
    pub fn cancelled_error(&self) -> Error {
        Error::Cancelled(self.cause().unwrap_or(CancelCause::Requested))
    }

    /// Race `fut` against this token.
    ///
    /// Returns `Err(Error::Cancelled)` if the token fires first; `fut` is then
    /// dropped at its current suspension point.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.cancelled_error()),
            output = fut => Ok(output),
        }
    }

    // Cancel the topmost node whose own deadline has passed, so that every
    // token sharing the expired ancestor observes the expiry.
    fn expire(&self) {
        let now = Instant::now();
        let mut expired = None;
        let mut node = Some(&self.node);
        while let Some(current) = node {
            if matches!(current.deadline, Some(d) if d <= now) {
                expired = Some(current);
            }
            node = current.parent.as_ref();
        }
        if let Some(target) = expired {
            if !target.token.is_cancelled() {
                let _ = target.cause.set(CancelCause::DeadlineExceeded);
                target.token.cancel();
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Extension trait for racing futures against a token
pub trait CancellableExt: Future + Sized {
    /// Resolve to `Err(Error::Cancelled)` if `token` fires first.
    fn cancellable(self, token: &CancelToken) -> impl Future<Output = Result<Self::Output>> {
        let token = token.clone();
        async move { token.run_until_cancelled(self).await }
    }
}

impl<F: Future> CancellableExt for F {}
