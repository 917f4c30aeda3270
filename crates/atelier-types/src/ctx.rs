//! Cooperative cancellation and deadlines.
//!
//! Every long-running operation takes a `Ctx` and calls [`Ctx::checkpoint`]
//! at its suspension points. Cancellation is never silent: it surfaces as
//! `CoreError::Cancelled` (or `DeadlineExceeded` once the deadline passes) at
//! the next checkpoint. Work already committed is not rolled back; idempotent
//! retries absorb the resulting ambiguity.

use crate::error::CoreError;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// A cancellation context with an optional deadline.
///
/// Cheap to clone; all clones observe the same cancellation signal. Child
/// contexts may tighten the deadline but never loosen it.
#[derive(Debug, Clone)]
pub struct Ctx {
    cancelled: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

/// The cancelling side of a [`Ctx`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every clone of the paired context.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Ctx {
    /// A root context with no deadline.
    pub fn background() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancelled: rx,
                deadline: None,
            },
            CancelHandle { tx },
        )
    }

    /// A root context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        let (ctx, handle) = Self::background();
        (
            Self {
                deadline: Some(Instant::now() + timeout),
                ..ctx
            },
            handle,
        )
    }

    /// Derive a child whose deadline is the sooner of the parent's and
    /// `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(candidate)),
            None => Some(candidate),
        };
        Self {
            cancelled: self.cancelled.clone(),
            deadline,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The suspension-point check: errors if cancelled or past deadline.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Wait until cancellation is signalled. Resolves immediately if the
    /// context is already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        if *rx.borrow() {
            return;
        }
        // The sender side dropping also counts as cancellation.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}
