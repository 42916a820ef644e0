//! Transfer bookkeeping: lifecycle phases, byte counters and the retry policy.

use std::time::Duration;

use crate::integrity::ContentHash;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Upload,
    Download,
}

/// `Waiting -> Active -> {Completed | Failed | RetryScheduled}`; `RetryScheduled -> Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    Waiting,
    Active,
    RetryScheduled,
    Completed,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferPhase::Completed | TransferPhase::Failed)
    }

    /// Whether `self -> next` is a legal step. Any non-terminal phase may fail (cancellation).
    pub fn can_advance_to(self, next: TransferPhase) -> bool {
        use TransferPhase::*;
        match (self, next) {
            (Waiting, Active) => true,
            (Active, Completed) | (Active, RetryScheduled) => true,
            (RetryScheduled, Waiting) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// State of one transfer as reported to the progress board.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub kind: TransferKind,
    pub hash: ContentHash,
    /// Expected size, when known up front.
    pub total: Option<u64>,
    pub transferred: u64,
    pub attempt: u32,
    phase: TransferPhase,
}

impl TransferRecord {
    pub fn new(kind: TransferKind, hash: ContentHash, total: Option<u64>) -> Self {
        Self {
            kind,
            hash,
            total,
            transferred: 0,
            attempt: 1,
            phase: TransferPhase::Waiting,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn advance(&mut self, next: TransferPhase) -> Result<(), TransitionError> {
        if !self.phase.can_advance_to(next) {
            return Err(TransitionError {
                from: self.phase,
                to: next,
            });
        }
        if self.phase == TransferPhase::RetryScheduled && next == TransferPhase::Waiting {
            self.attempt += 1;
        }
        self.phase = next;
        Ok(())
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.transferred = self.transferred.saturating_add(n);
    }

    /// Zero the byte counter (after a failed verification).
    pub fn reset_progress(&mut self) {
        self.transferred = 0;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal transfer transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TransferPhase,
    pub to: TransferPhase,
}

/// Bounded retry with a fixed backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}
