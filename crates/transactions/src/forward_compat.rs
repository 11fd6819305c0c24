//! Forward-compatibility checks
//!
//! A newer writer can stamp a document or ATR entry with a block of
//! markers telling older clients what they may still do with its
//! artifacts. Before acting on foreign transactional state, the engine
//! checks the block for the stage it is about to enter; an entry this
//! client cannot satisfy either fails the attempt or asks for a
//! transaction retry (optionally after a pause), as the writer dictated.
//!
//! Block shape, keyed by stage name:
//!
//! ```json
//! { "GETS": [ { "p": "2.2", "b": "f" }, { "e": "BF1234", "b": "r", "ra": 100 } ] }
//! ```
//!
//! `p` requires a minimum protocol version, `e` requires a named
//! extension; `b` is the behavior on mismatch (`"f"` fail, `"r"` retry)
//! and `ra` an optional pause in milliseconds before retrying.

use crate::error::{ErrorCause, ErrorClass, TransactionOperationFailed};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Protocol version this client implements.
const PROTOCOL_VERSION: (u32, u32) = (2, 0);

/// Extensions this client implements, by wire id.
const SUPPORTED_EXTENSIONS: &[&str] = &[];

/// The stages a forward-compatibility block can gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompatStage {
    /// Reading a staged document.
    Gets,
    /// Reading the ATR entry behind a staged document.
    GetsReadingAtr,
    /// Reading the ATR entry behind a blocking write.
    WriteWriteConflictReadingAtr,
    /// Replacing over a foreign staged write.
    WriteWriteConflictReplacing,
    /// Removing over a foreign staged write.
    WriteWriteConflictRemoving,
    /// Inserting over a foreign staged write.
    WriteWriteConflictInserting,
    /// Refetching an existing document during a contested insert.
    WriteWriteConflictInsertingGet,
    /// Cleaning up a foreign attempt.
    CleanupEntry,
}

impl ForwardCompatStage {
    fn wire_name(&self) -> &'static str {
        match self {
            ForwardCompatStage::Gets => "GETS",
            ForwardCompatStage::GetsReadingAtr => "GETS_READING_ATR",
            ForwardCompatStage::WriteWriteConflictReadingAtr => "WWC_READING_ATR",
            ForwardCompatStage::WriteWriteConflictReplacing => "WWC_REPLACING",
            ForwardCompatStage::WriteWriteConflictRemoving => "WWC_REMOVING",
            ForwardCompatStage::WriteWriteConflictInserting => "WWC_INSERTING",
            ForwardCompatStage::WriteWriteConflictInsertingGet => "WWC_INSERTING_GET",
            ForwardCompatStage::CleanupEntry => "CLEANUP_ENTRY",
        }
    }
}

impl fmt::Display for ForwardCompatStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Requirement {
    #[serde(rename = "p")]
    protocol: Option<String>,
    #[serde(rename = "e")]
    extension: Option<String>,
    #[serde(rename = "b")]
    behavior: String,
    #[serde(rename = "ra")]
    retry_after_ms: Option<u64>,
}

impl Requirement {
    fn satisfied(&self) -> bool {
        if let Some(p) = &self.protocol {
            if !protocol_at_least(p) {
                return false;
            }
        }
        if let Some(e) = &self.extension {
            if !SUPPORTED_EXTENSIONS.contains(&e.as_str()) {
                return false;
            }
        }
        true
    }
}

fn protocol_at_least(required: &str) -> bool {
    let mut parts = required.splitn(2, '.');
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(u32::MAX);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    PROTOCOL_VERSION >= (major, minor)
}

/// A parsed forward-compatibility block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardCompat(
    std::collections::HashMap<String, Vec<Requirement>>,
);

impl ForwardCompat {
    /// Parse a block from its JSON form.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

/// Check a block before acting on foreign state at `stage`.
///
/// `Ok(())` when there is no block, no entry for the stage, or every
/// entry is satisfied. Otherwise the attempt fails with a
/// forward-compatibility cause; a `"r"` behavior asks the driver for a
/// transaction retry, pausing first when the writer requested it.
pub fn check(
    stage: ForwardCompatStage,
    block: Option<&ForwardCompat>,
) -> Result<(), TransactionOperationFailed> {
    let Some(block) = block else {
        return Ok(());
    };
    let Some(requirements) = block.0.get(stage.wire_name()) else {
        return Ok(());
    };
    for requirement in requirements {
        if requirement.satisfied() {
            continue;
        }
        tracing::debug!(
            stage = %stage,
            behavior = %requirement.behavior,
            "forward compatibility requirement not met"
        );
        let err = TransactionOperationFailed::new(
            ErrorClass::FailOther,
            format!("forward compatibility failure at {stage}"),
        )
        .cause(ErrorCause::ForwardCompatibilityFailure);
        if requirement.behavior == "r" {
            if let Some(ms) = requirement.retry_after_ms {
                std::thread::sleep(Duration::from_millis(ms));
            }
            return Err(err.retry());
        }
        return Err(err);
    }
    Ok(())
}
