use derive_more::Display;
use serde::Serialize;
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Copy, Debug, Display, Default, Serialize, PartialEq, Eq)]
pub enum OperationStatus {
    #[default]
    Initializing,
    CleaningOld,
    BackingUp,
    SendingToRemote,
    ExecutingUserCommand,
    Restoring,
    ReceivingFromRemote,
}

/// Snapshot of an operation's progress.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct OperationProgress {
    pub status: OperationStatus,
    pub current: usize,
    pub total: usize,
    /// Best effort, empty when unknown
    pub current_name: String,
}

/// Progress written by the worker thread and read by anyone.
///
/// Counters are reset on every phase transition and only grow within a phase.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: RwLock<OperationProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OperationProgress {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> OperationStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Starts a new phase.
    pub fn enter(&self, status: OperationStatus, total: usize) {
        let mut progress = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *progress = OperationProgress {
            status,
            current: 0,
            total,
            current_name: String::new(),
        };
    }

    pub fn set_total(&self, total: usize) {
        let mut progress = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        progress.total = total.max(progress.current);
    }

    /// Marks the start of unit `current` (1-based) named `name`.
    pub fn advance<S: Into<String>>(&self, current: usize, name: S) {
        let mut progress = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        progress.current = current.max(progress.current);
        progress.current_name = name.into();
    }
}
