//! # Transfer State
//!
//! Tracks the single in-flight transfer allowed per direction on a polling
//! backend. Submitting a second same-direction transfer while one is still
//! pending is refused; the USB endpoint state would be corrupted otherwise.

use crate::error::{FalconError, Result};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write,
    Read,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Write => "write",
            Direction::Read => "read",
        }
    }
}

/// State of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Pending { len: usize },
}

/// One-in-flight bookkeeping for a single direction
#[derive(Debug, Clone)]
pub struct TransferTracker {
    direction: Direction,
    state: TransferState,
    submitted: u64,
    completed: u64,
}

impl TransferTracker {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: TransferState::Idle,
            submitted: 0,
            completed: 0,
        }
    }

    /// Mark a transfer of `len` bytes as submitted
    ///
    /// # Errors
    ///
    /// Returns `TransferPending` if a transfer in this direction is in flight
    pub fn begin(&mut self, len: usize) -> Result<()> {
        if let TransferState::Pending { .. } = self.state {
            return Err(FalconError::TransferPending(self.direction.as_str()));
        }
        self.state = TransferState::Pending { len };
        self.submitted += 1;
        Ok(())
    }

    /// Mark the in-flight transfer as finished
    ///
    /// # Returns
    ///
    /// * `Option<usize>` - Submitted length, or `None` if nothing was in flight
    pub fn complete(&mut self) -> Option<usize> {
        match std::mem::take(&mut self.state) {
            TransferState::Pending { len } => {
                self.completed += 1;
                Some(len)
            }
            TransferState::Idle => None,
        }
    }

    /// Forget the in-flight transfer without counting a completion
    pub fn cancel(&mut self) {
        self.state = TransferState::Idle;
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, TransferState::Pending { .. })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Transfers submitted since creation
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Transfers completed since creation
    pub fn completed(&self) -> u64 {
        self.completed
    }
}
