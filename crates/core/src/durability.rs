//! Write durability levels
//!
//! Every ATR write and every staging write carries the durability level
//! configured at transaction scope. The level names follow the server's
//! durability vocabulary.

use serde::{Deserialize, Serialize};

/// Durability requested for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurabilityLevel {
    /// No durability requirement beyond the active node's memory.
    None,
    /// A majority of replicas have the write in memory.
    #[default]
    Majority,
    /// Majority, and the active node has persisted the write to disk.
    MajorityAndPersistOnMaster,
    /// A majority of replicas have persisted the write to disk.
    PersistToMajority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_majority() {
        assert_eq!(DurabilityLevel::default(), DurabilityLevel::Majority);
    }

    #[test]
    fn wire_names_are_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&DurabilityLevel::PersistToMajority).unwrap(),
            "\"PERSIST_TO_MAJORITY\""
        );
        let parsed: DurabilityLevel =
            serde_json::from_str("\"MAJORITY_AND_PERSIST_ON_MASTER\"").unwrap();
        assert_eq!(parsed, DurabilityLevel::MajorityAndPersistOnMaster);
    }
}
