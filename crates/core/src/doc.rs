//! Document addressing
//!
//! A document is addressed by the four-part tuple
//! (bucket, scope, collection, key). All four segments together identify
//! a document; two ids differing in any segment address different
//! documents.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-qualified address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    /// Bucket name
    pub bucket: String,
    /// Scope name within the bucket
    pub scope: String,
    /// Collection name within the scope
    pub collection: String,
    /// Document key within the collection
    pub key: String,
}

impl DocumentId {
    /// Create a fully-qualified document id.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// The `scope.collection` qualifier used when a single field has to
    /// carry both segments.
    pub fn collection_spec(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}
