//! # Atrium
//!
//! Client-side distributed transactions for document-oriented stores
//! with subdocument mutations and extended attributes.
//!
//! A transaction is a closure over reads, inserts, replaces, and removes
//! across any number of documents; Atrium executes it with all-or-nothing
//! visibility, retries it on contention and transient failure, and cleans
//! up after clients that never came back.
//!
//! ```no_run
//! use atrium::{DocumentId, TransactionConfig, Transactions};
//! use atrium_core::testing::MockCluster;
//! use std::sync::Arc;
//!
//! let cluster = Arc::new(MockCluster::new());
//! let transactions = Transactions::new(cluster, TransactionConfig::default());
//!
//! let account_a = DocumentId::new("bank", "_default", "_default", "account:a");
//! let account_b = DocumentId::new("bank", "_default", "_default", "account:b");
//! let outcome = transactions.run(move |ctx| {
//!     let a = ctx.get(&account_a)?;
//!     let b = ctx.get(&account_b)?;
//!     ctx.replace(&a, br#"{"balance": 90}"#)?;
//!     ctx.replace(&b, br#"{"balance": 110}"#)?;
//!     Ok(())
//! });
//! # let _ = outcome;
//! ```
//!
//! The transport is pluggable: anything implementing
//! `atrium_core::KvClient` (subdocument lookups/mutations plus
//! full-document insert/upsert/remove with CAS and durability) can back
//! the runtime.

// Re-export the public API from atrium-transactions
pub use atrium_transactions::*;
