//! Per-transaction shared state
//!
//! One [`TransactionShared`] lives for the whole user-visible transaction
//! and is read by every attempt the driver spins up for it: the
//! transaction id, the wall-clock budget, the elected ATR (chosen by the
//! first attempt that mutates and reused by every retry), and the ordered
//! attempt history.

use crate::atr::AttemptState;
use crate::config::TransactionConfig;
use atrium_core::DocumentId;
use parking_lot::Mutex;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

/// Snapshot of one attempt, kept in the transaction's history.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Attempt id.
    pub id: String,
    /// Final (or current) state.
    pub state: AttemptState,
    /// Doc keys staged for insert.
    pub inserted_ids: Vec<DocumentId>,
    /// Doc keys staged for replace.
    pub replaced_ids: Vec<DocumentId>,
    /// Doc keys staged for remove.
    pub removed_ids: Vec<DocumentId>,
    /// When the attempt started.
    pub started_at: SystemTime,
    /// When the commit sequence started.
    pub commit_started_at: Option<SystemTime>,
    /// When the rollback sequence started.
    pub rollback_started_at: Option<SystemTime>,
    /// When the attempt reached a terminal state.
    pub completed_at: Option<SystemTime>,
}

impl AttemptRecord {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: AttemptState::NotStarted,
            inserted_ids: Vec::new(),
            replaced_ids: Vec::new(),
            removed_ids: Vec::new(),
            started_at: SystemTime::now(),
            commit_started_at: None,
            rollback_started_at: None,
            completed_at: None,
        }
    }
}

/// State shared by every attempt of one transaction.
pub struct TransactionShared {
    transaction_id: String,
    start_time: Instant,
    deferred_elapsed: Duration,
    expiration_time: Duration,
    atr_id: Mutex<Option<DocumentId>>,
    attempts: Mutex<Vec<AttemptRecord>>,
}

impl TransactionShared {
    /// Fresh state for a transaction starting now.
    pub fn new(config: &TransactionConfig) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            deferred_elapsed: Duration::ZERO,
            expiration_time: config.expiration_time,
            atr_id: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// The transaction id.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Whether the wall-clock budget is spent, counting time carried over
    /// from a deferred start.
    pub fn has_expired_client_side(&self) -> bool {
        let elapsed = self.start_time.elapsed() + self.deferred_elapsed;
        let expired = elapsed > self.expiration_time;
        if expired {
            tracing::debug!(
                transaction_id = %self.transaction_id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.expiration_time.as_millis() as u64,
                "transaction has expired client side"
            );
        }
        expired
    }

    /// Time left in the budget.
    pub fn remaining(&self) -> Duration {
        self.expiration_time
            .saturating_sub(self.start_time.elapsed() + self.deferred_elapsed)
    }

    /// The elected ATR, once any attempt has mutated.
    pub fn atr_id(&self) -> Option<DocumentId> {
        self.atr_id.lock().clone()
    }

    /// Elect the ATR if nobody has; returns the winner either way.
    pub fn elect_atr(&self, candidate: DocumentId) -> DocumentId {
        let mut slot = self.atr_id.lock();
        slot.get_or_insert(candidate).clone()
    }

    /// Open a new attempt and return its id.
    pub fn add_attempt(&self) -> String {
        let record = AttemptRecord::new();
        let id = record.id.clone();
        self.attempts.lock().push(record);
        tracing::trace!(
            transaction_id = %self.transaction_id,
            attempt_id = %id,
            "added new attempt"
        );
        id
    }

    /// Number of attempts so far.
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Mutate the newest attempt record.
    pub fn with_current_attempt<R>(&self, f: impl FnOnce(&mut AttemptRecord) -> R) -> Option<R> {
        self.attempts.lock().last_mut().map(f)
    }

    /// Copy of the attempt history.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.lock().clone()
    }
}
