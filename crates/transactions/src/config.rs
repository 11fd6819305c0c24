//! Transaction configuration
//!
//! The option set is closed. Options can be set programmatically through
//! the builder, or loaded from JSON where any unrecognized key is a
//! configuration error.

use crate::hooks::{AttemptContextHooks, CleanupHooks};
use atrium_core::{DocumentId, DurabilityLevel};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default overall transaction expiration.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);
/// Default period of the lost-attempts scanner.
pub const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);

/// A malformed or unrecognized configuration input.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON form failed to parse or contained unknown options.
    #[error("invalid transaction configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Options governing every transaction started from one driver.
#[derive(Clone)]
pub struct TransactionConfig {
    // Debug is implemented manually below because the hook tables hold
    // trait-object closures, which aren't `Debug`.
    /// Overall wall-clock budget for one transaction, retries included.
    pub expiration_time: Duration,
    /// Durability applied to every ATR and staging write.
    pub durability_level: DurabilityLevel,
    /// Period of the lost-attempts scanner.
    pub cleanup_window: Duration,
    /// Run the periodic scan for attempts abandoned by other clients.
    pub cleanup_lost_attempts: bool,
    /// Queue this client's own finished attempts for cleanup.
    pub cleanup_client_attempts: bool,
    /// Overrides the ATR home (bucket/scope/collection); the canonical
    /// per-vbucket key is still appended.
    pub metadata_collection: Option<DocumentId>,
    /// Fault-injection points for the attempt engine.
    pub attempt_context_hooks: Arc<AttemptContextHooks>,
    /// Fault-injection points for the cleanup path.
    pub cleanup_hooks: Arc<CleanupHooks>,
}

impl std::fmt::Debug for TransactionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionConfig")
            .field("expiration_time", &self.expiration_time)
            .field("durability_level", &self.durability_level)
            .field("cleanup_window", &self.cleanup_window)
            .field("cleanup_lost_attempts", &self.cleanup_lost_attempts)
            .field("cleanup_client_attempts", &self.cleanup_client_attempts)
            .field("metadata_collection", &self.metadata_collection)
            .finish_non_exhaustive()
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration_time: DEFAULT_EXPIRATION,
            durability_level: DurabilityLevel::default(),
            cleanup_window: DEFAULT_CLEANUP_WINDOW,
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            metadata_collection: None,
            attempt_context_hooks: Arc::new(AttemptContextHooks::default()),
            cleanup_hooks: Arc::new(CleanupHooks::default()),
        }
    }
}

impl TransactionConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> TransactionConfigBuilder {
        TransactionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load the serializable subset from JSON. Unknown keys are rejected;
    /// hooks can only be attached programmatically.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let file: TransactionConfigFile = serde_json::from_slice(bytes)?;
        let mut config = Self::default();
        if let Some(ms) = file.expiration_time_ms {
            config.expiration_time = Duration::from_millis(ms);
        }
        if let Some(level) = file.durability_level {
            config.durability_level = level;
        }
        if let Some(ms) = file.cleanup_window_ms {
            config.cleanup_window = Duration::from_millis(ms);
        }
        if let Some(flag) = file.cleanup_lost_attempts {
            config.cleanup_lost_attempts = flag;
        }
        if let Some(flag) = file.cleanup_client_attempts {
            config.cleanup_client_attempts = flag;
        }
        config.metadata_collection = file.metadata_collection;
        Ok(config)
    }
}

/// The serializable option subset; unknown keys fail deserialization.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransactionConfigFile {
    expiration_time_ms: Option<u64>,
    durability_level: Option<DurabilityLevel>,
    cleanup_window_ms: Option<u64>,
    cleanup_lost_attempts: Option<bool>,
    cleanup_client_attempts: Option<bool>,
    metadata_collection: Option<DocumentId>,
}

/// Fluent construction of a [`TransactionConfig`].
pub struct TransactionConfigBuilder {
    config: TransactionConfig,
}

impl TransactionConfigBuilder {
    /// Overall wall-clock budget for one transaction.
    pub fn expiration_time(mut self, value: Duration) -> Self {
        self.config.expiration_time = value;
        self
    }

    /// Durability applied to every ATR and staging write.
    pub fn durability_level(mut self, value: DurabilityLevel) -> Self {
        self.config.durability_level = value;
        self
    }

    /// Period of the lost-attempts scanner.
    pub fn cleanup_window(mut self, value: Duration) -> Self {
        self.config.cleanup_window = value;
        self
    }

    /// Run the periodic scan for attempts abandoned by other clients.
    pub fn cleanup_lost_attempts(mut self, value: bool) -> Self {
        self.config.cleanup_lost_attempts = value;
        self
    }

    /// Queue this client's own finished attempts for cleanup.
    pub fn cleanup_client_attempts(mut self, value: bool) -> Self {
        self.config.cleanup_client_attempts = value;
        self
    }

    /// Override the ATR home collection.
    pub fn metadata_collection(mut self, value: DocumentId) -> Self {
        self.config.metadata_collection = Some(value);
        self
    }

    /// Attach attempt-engine fault-injection hooks.
    pub fn attempt_context_hooks(mut self, value: AttemptContextHooks) -> Self {
        self.config.attempt_context_hooks = Arc::new(value);
        self
    }

    /// Attach cleanup fault-injection hooks.
    pub fn cleanup_hooks(mut self, value: CleanupHooks) -> Self {
        self.config.cleanup_hooks = Arc::new(value);
        self
    }

    /// Finish the build.
    pub fn build(self) -> TransactionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.expiration_time, Duration::from_secs(60));
        assert_eq!(config.cleanup_window, Duration::from_secs(60));
        assert!(config.cleanup_lost_attempts);
        assert!(config.cleanup_client_attempts);
        assert!(config.metadata_collection.is_none());
    }

    #[test]
    fn json_round_trip() {
        let config = TransactionConfig::from_json(
            br#"{"expiration_time_ms": 500, "durability_level": "NONE", "cleanup_lost_attempts": false}"#,
        )
        .unwrap();
        assert_eq!(config.expiration_time, Duration::from_millis(500));
        assert_eq!(config.durability_level, DurabilityLevel::None);
        assert!(!config.cleanup_lost_attempts);
        assert!(config.cleanup_client_attempts);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = TransactionConfig::from_json(br#"{"expiratoin_time_ms": 500}"#).unwrap_err();
        assert!(err.to_string().contains("invalid transaction configuration"));
    }

    #[test]
    fn builder_overrides() {
        let config = TransactionConfig::builder()
            .expiration_time(Duration::from_millis(50))
            .cleanup_client_attempts(false)
            .metadata_collection(DocumentId::new("meta", "_default", "_default", ""))
            .build();
        assert_eq!(config.expiration_time, Duration::from_millis(50));
        assert!(!config.cleanup_client_attempts);
        assert_eq!(config.metadata_collection.unwrap().bucket, "meta");
    }
}
