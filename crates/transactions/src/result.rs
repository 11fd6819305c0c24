//! The user-visible outcome of a transaction run.

use crate::context::AttemptRecord;
use atrium_core::DocumentId;

/// What a finished (or finally failed) transaction looked like.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// The transaction id.
    pub transaction_id: String,
    /// The elected ATR, when any attempt mutated.
    pub atr_id: Option<DocumentId>,
    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    /// All staged content reached its final place. When false after a
    /// successful commit, background cleanup finishes the unstaging.
    pub unstaging_complete: bool,
}
