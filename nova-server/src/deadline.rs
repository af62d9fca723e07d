//! Re-armable wall-clock deadline for a session.
//!
//! Every suspension point of a session (handshake, read, write, TLS
//! shutdown) goes through [`Deadline::run`], so arming the timer and
//! enforcing it live in one place instead of being scattered through the
//! session loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};

/// Raised when the armed deadline passes before the guarded operation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// A deadline that is either disarmed (never expires) or armed at an instant
#[derive(Debug, Default)]
pub struct Deadline {
    expiry: Option<Instant>,
}

impl Deadline {
    /// Create a disarmed deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline `timeout` from now, replacing any previous expiry
    pub fn expires_after(&mut self, timeout: Duration) {
        self.expiry = Some(Instant::now() + timeout);
    }

    /// Disarm the deadline
    pub fn cancel(&mut self) {
        self.expiry = None;
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// Whether the deadline is armed and already in the past
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|at| at <= Instant::now())
    }

    /// Time left before expiry, `None` when disarmed
    pub fn remaining(&self) -> Option<Duration> {
        self.expiry
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Drive `operation` to completion unless the deadline passes first.
    ///
    /// Expiry drops the operation, which cancels whatever I/O it had
    /// outstanding.
    pub async fn run<F>(&self, operation: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        match self.expiry {
            Some(at) => time::timeout_at(at, operation)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(operation.await),
        }
    }
}
