//! Client-side distributed transactions for document stores
//!
//! This crate implements atomic multi-document transactions on top of a
//! store that offers compare-and-swap per document and atomic multi-path
//! subdocument mutations with extended attributes (XATTRs):
//!
//! - mutations are *staged* into the target documents' XATTRs without
//!   touching their visible bodies
//! - every transaction registers with an Active Transaction Record (ATR),
//!   a well-known document whose per-attempt status field is the single
//!   source of truth; readers see all staged writes or none, deciding by
//!   that status
//! - contention, transient failures, and ambiguity retry safely; the
//!   configured expiration bounds the whole transaction
//! - a background service completes or rolls back attempts whose clients
//!   crashed
//!
//! # Quick start
//!
//! ```no_run
//! use atrium_core::{testing::MockCluster, DocumentId};
//! use atrium_transactions::{TransactionConfig, Transactions};
//! use std::sync::Arc;
//!
//! let cluster = Arc::new(MockCluster::new());
//! let transactions = Transactions::new(cluster, TransactionConfig::default());
//!
//! let doc = DocumentId::new("travel", "_default", "_default", "hotel_77");
//! let result = transactions.run(move |ctx| {
//!     let snapshot = ctx.get(&doc)?;
//!     ctx.replace(&snapshot, br#"{"vacancies": 12}"#)?;
//!     Ok(())
//! });
//! # let _ = result;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atr;
pub mod atr_ids;
pub mod attempt;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod error;
pub mod fields;
pub mod forward_compat;
pub mod hooks;
pub mod links;
pub mod result;
pub mod staged;

mod driver;

pub use atr::{ActiveTransactionRecord, AtrEntry, AttemptState, DocRecord};
pub use attempt::{AttemptContext, OpResult};
pub use cleanup::{AtrCleanupEntry, CleanupQueue, TransactionsCleanup};
pub use config::{ConfigError, TransactionConfig, TransactionConfigBuilder};
pub use context::AttemptRecord;
pub use driver::{TransactionLogic, Transactions};
pub use error::{
    ErrorCause, ErrorClass, FinalErrorKind, TransactionError, TransactionOperationFailed,
};
pub use hooks::{AttemptContextHooks, CleanupHooks};
pub use links::{DocumentMetadata, TransactionGetResult, TransactionLinks};
pub use result::TransactionResult;
pub use staged::{StagedMutation, StagedMutationKind, StagedMutationSet};

// The core addressing and transport types are part of this crate's API.
pub use atrium_core::{DocumentId, DurabilityLevel};
