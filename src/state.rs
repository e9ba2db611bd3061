//! Sync lifecycle state machine and error taxonomy.
//!
//! A sync moves `idle → syncing → completed | error`. Finished states can
//! start another sync or be reset to idle. Every change is published on a
//! [`tokio::sync::watch`] channel so callers can follow progress.

use std::fmt;

use tokio::sync::watch;

/// Errors surfaced by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Transport failure or non-success HTTP status.
    #[error("network error: {0}")]
    Network(String),
    /// The server or local store returned data that violates the bundle invariants.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The local key-value store failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// JSON did not match the expected shape.
    #[error("decoding error: {0}")]
    Decoding(String),
    /// Another sync is still running.
    #[error("a sync is already in progress")]
    AlreadySyncing,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decoding(e.to_string())
    }
}

macro_rules! storage_errors {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SyncError {
                fn from(e: $ty) -> Self {
                    SyncError::Storage(e.to_string())
                }
            }
        )*
    };
}

storage_errors!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Where the bundle sync currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BundleSyncState {
    #[default]
    Idle,
    Syncing,
    Completed,
    Error(String),
}

impl BundleSyncState {
    /// Fixed adjacency list of the lifecycle.
    pub fn can_transition_to(&self, next: &BundleSyncState) -> bool {
        use BundleSyncState::*;
        matches!(
            (self, next),
            (Idle, Syncing)
                | (Syncing, Completed)
                | (Syncing, Error(_))
                | (Completed, Syncing)
                | (Completed, Idle)
                | (Error(_), Syncing)
                | (Error(_), Idle)
        )
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, BundleSyncState::Syncing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            BundleSyncState::Idle => "idle",
            BundleSyncState::Syncing => "syncing",
            BundleSyncState::Completed => "completed",
            BundleSyncState::Error(_) => "error",
        }
    }
}

impl fmt::Display for BundleSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleSyncState::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Owns the current [`BundleSyncState`] and enforces the transition rules.
pub struct SyncStateTracker {
    tx: watch::Sender<BundleSyncState>,
}

impl Default for SyncStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BundleSyncState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> BundleSyncState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BundleSyncState> {
        self.tx.subscribe()
    }

    /// Enter `syncing`. Fails with [`SyncError::AlreadySyncing`] when a sync
    /// is running; the check and the update happen under one lock.
    ///
    /// The returned guard must be finished with the outcome. Dropping it
    /// unfinished, for example when the sync future is cancelled, moves the
    /// state to `error` so the next sync can start.
    pub fn begin(&self) -> SyncResult<SyncGuard<'_>> {
        let mut started = false;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(&BundleSyncState::Syncing) {
                *state = BundleSyncState::Syncing;
                started = true;
                true
            } else {
                false
            }
        });
        if started {
            Ok(SyncGuard {
                tracker: self,
                finished: false,
            })
        } else {
            Err(SyncError::AlreadySyncing)
        }
    }

    /// Back to `idle` from a finished state.
    pub fn reset(&self) {
        self.transition(BundleSyncState::Idle);
    }

    fn transition(&self, next: BundleSyncState) {
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(&next) {
                *state = next;
                true
            } else {
                tracing::warn!("Ignoring sync state change {} -> {}", state, next);
                false
            }
        });
    }
}

/// A sync in progress, handed out by [`SyncStateTracker::begin`].
#[must_use = "dropping the guard cancels the sync"]
pub struct SyncGuard<'a> {
    tracker: &'a SyncStateTracker,
    finished: bool,
}

impl SyncGuard<'_> {
    /// Leave `syncing` according to the outcome of the operation.
    pub fn finish<T>(mut self, result: &SyncResult<T>) {
        self.finished = true;
        let next = match result {
            Ok(_) => BundleSyncState::Completed,
            Err(e) => BundleSyncState::Error(e.to_string()),
        };
        self.tracker.transition(next);
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Sync dropped before it finished");
            self.tracker
                .transition(BundleSyncState::Error(CANCELLED.to_string()));
        }
    }
}

/// Reason recorded when a sync is dropped mid-flight.
pub const CANCELLED: &str = "sync cancelled";
