//! Core types and the transport contract for Atrium
//!
//! This crate defines everything the transactions runtime needs from the
//! underlying document store, without depending on any particular client:
//! - DocumentId: four-part document addressing (bucket/scope/collection/key)
//! - KvClient: the transport trait (subdocument lookups and mutations,
//!   full-document insert/upsert/remove)
//! - Subdoc model: lookup/mutate specs, store semantics, CAS macros
//! - KvError: the closed set of transport outcomes
//! - DurabilityLevel: write durability requested per request
//! - Retry/backoff utilities with jitter
//! - `testing`: an in-memory cluster honoring the full contract, used by
//!   the integration suites

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod doc;
pub mod durability;
pub mod error;
pub mod kv;
pub mod retry;
pub mod subdoc;
pub mod testing;

pub use doc::DocumentId;
pub use durability::DurabilityLevel;
pub use error::{KvError, KvResult};
pub use kv::{
    KvClient, LookupInField, LookupInRequest, LookupInResponse, MutateInRequest, MutateInResponse,
};
pub use retry::{ExpDelay, RetryExhausted};
pub use subdoc::{LookupInSpec, MutateInSpec, StoreSemantics, MACRO_CAS, MACRO_VALUE_CRC32C};
