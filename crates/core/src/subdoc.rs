//! Subdocument operation model
//!
//! Lookups and mutations address paths inside a document. A path with the
//! XATTR flag addresses the document's extended attributes instead of its
//! body; the reserved virtual path `$document` exposes server metadata
//! (CAS, revid, expiry, value CRC32).
//!
//! Mutation values may contain macros that the server expands at write
//! time when the spec sets `expand_macros`:
//! - [`MACRO_CAS`] becomes the CAS assigned by this mutation
//! - [`MACRO_VALUE_CRC32C`] becomes the CRC32 of the document value after
//!   this mutation

/// Macro expanded to the mutation's own CAS.
pub const MACRO_CAS: &str = "${Mutation.CAS}";

/// Macro expanded to the CRC32 of the document value after the mutation.
pub const MACRO_VALUE_CRC32C: &str = "${Mutation.ValueCRC32c}";

/// Virtual XATTR path exposing document metadata.
pub const DOCUMENT_METADATA_PATH: &str = "$document";

/// How a subdocument mutation treats the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    /// The document must not already exist.
    Insert,
    /// The document must already exist.
    #[default]
    Replace,
    /// Create the document if missing, update it otherwise.
    Upsert,
}

/// One path read inside a `lookup_in`.
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    /// Path to read; empty for a full-document get.
    pub path: String,
    /// Read from the XATTRs rather than the body.
    pub xattr: bool,
    /// Fetch the whole document body instead of a path.
    pub get_doc: bool,
}

impl LookupInSpec {
    /// Read a path from the document body or, with [`Self::xattr`], from
    /// the extended attributes.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            xattr: false,
            get_doc: false,
        }
    }

    /// Read the full document body.
    pub fn get_doc() -> Self {
        Self {
            path: String::new(),
            xattr: false,
            get_doc: true,
        }
    }

    /// Mark this spec as an XATTR read.
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }
}

/// The mutation applied by one `mutate_in` spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateInOp {
    /// Add a dictionary field; fails if the path exists.
    DictAdd,
    /// Add or overwrite a dictionary field.
    DictUpsert,
    /// Remove the path; fails if it is absent.
    Remove,
    /// Replace the whole document body.
    SetDoc,
}

/// One mutation inside a `mutate_in`.
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    /// The operation to apply.
    pub op: MutateInOp,
    /// Target path; empty only for [`MutateInOp::SetDoc`].
    pub path: String,
    /// JSON-encoded value; empty for [`MutateInOp::Remove`].
    pub value: Vec<u8>,
    /// Address the XATTRs rather than the body.
    pub xattr: bool,
    /// Create missing intermediate path segments.
    pub create_path: bool,
    /// Expand macros in `value` at write time.
    pub expand_macros: bool,
}

impl MutateInSpec {
    /// Add-or-overwrite of a dictionary field.
    pub fn dict_upsert(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutateInOp::DictUpsert,
            path: path.into(),
            value: value.into(),
            xattr: false,
            create_path: false,
            expand_macros: false,
        }
    }

    /// Add of a dictionary field that must not yet exist.
    pub fn dict_add(path: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutateInOp::DictAdd,
            path: path.into(),
            value: value.into(),
            xattr: false,
            create_path: false,
            expand_macros: false,
        }
    }

    /// Removal of a path.
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: MutateInOp::Remove,
            path: path.into(),
            value: Vec::new(),
            xattr: false,
            create_path: false,
            expand_macros: false,
        }
    }

    /// Replacement of the whole document body.
    pub fn set_doc(value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: MutateInOp::SetDoc,
            path: String::new(),
            value: value.into(),
            xattr: false,
            create_path: false,
            expand_macros: false,
        }
    }

    /// Mark this spec as an XATTR write.
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    /// Create missing intermediate path segments.
    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }

    /// Expand macros in the value at write time.
    pub fn expand_macros(mut self) -> Self {
        self.expand_macros = true;
        self
    }
}
