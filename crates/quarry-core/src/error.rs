//! Core error types.

use quarry_proto::Scope;
use thiserror::Error;

/// Broad category of an [`Error`], used by client layers to pick a response
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caused by the caller; the query must be corrected.
    Usage,
    /// Planner or engine bug; never user-recoverable.
    Internal,
    /// Invalid schema definition.
    SchemaValidation,
    /// Failure of a collaborator (storage, encoding).
    Storage,
}

/// Query engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Attribute does not exist in the collection schema.
    #[error("attribute `{attribute}` not found in `{collection}`")]
    AttributeNotFound {
        attribute: String,
        collection: String,
    },

    /// Attribute exists but is not filterable in the requested scope.
    #[error("attribute `{attribute}` of `{collection}` is not filterable in scope {scope}")]
    AttributeNotFilterable {
        attribute: String,
        collection: String,
        scope: Scope,
    },

    /// Attribute exists but is not sortable in the requested scope.
    #[error("attribute `{attribute}` of `{collection}` is not sortable in scope {scope}")]
    AttributeNotSortable {
        attribute: String,
        collection: String,
        scope: Scope,
    },

    /// Reference does not exist in the collection schema.
    #[error("reference `{reference}` not found in `{collection}`")]
    ReferenceNotFound {
        reference: String,
        collection: String,
    },

    /// Reference exists but is not indexed in the requested scope.
    #[error("reference `{reference}` of `{collection}` is not indexed in scope {scope}")]
    ReferenceNotIndexed {
        reference: String,
        collection: String,
        scope: Scope,
    },

    /// The query must target a single collection.
    #[error("entity collection must be specified: {0}")]
    EntityCollectionRequired(String),

    /// Target collection does not exist.
    #[error("collection `{0}` not found")]
    CollectionNotFound(String),

    /// Structurally invalid query.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Planning produced no plan at all.
    #[error("no query plan was produced for {0}")]
    NoQueryPlan(String),

    /// Alternative plans produced different results.
    #[error("inconsistent results: {0}")]
    InconsistentResults(String),

    /// A formula was computed before it was bound to an execution.
    #[error("formula `{0}` computed before initialization")]
    FormulaNotInitialized(String),

    /// An index of an unexpected kind was found.
    #[error("index type mismatch: expected {expected}, found {found}")]
    IndexTypeMismatch { expected: String, found: String },

    /// Other internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Aggregated schema violations.
    #[error("schema validation failed: {}", .0.join("; "))]
    SchemaValidation(Vec<String>),

    /// Storage collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] quarry_proto::Error),
}

impl Error {
    /// Category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AttributeNotFound { .. }
            | Error::AttributeNotFilterable { .. }
            | Error::AttributeNotSortable { .. }
            | Error::ReferenceNotFound { .. }
            | Error::ReferenceNotIndexed { .. }
            | Error::EntityCollectionRequired(_)
            | Error::CollectionNotFound(_)
            | Error::InvalidQuery(_) => ErrorKind::Usage,
            Error::NoQueryPlan(_)
            | Error::InconsistentResults(_)
            | Error::FormulaNotInitialized(_)
            | Error::IndexTypeMismatch { .. }
            | Error::Internal(_) => ErrorKind::Internal,
            Error::SchemaValidation(_) => ErrorKind::SchemaValidation,
            Error::Storage(_) | Error::Serialization(_) | Error::Protocol(_) => ErrorKind::Storage,
        }
    }

    /// Whether the error was caused by the caller.
    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let usage = Error::AttributeNotFilterable {
            attribute: "price".into(),
            collection: "Product".into(),
            scope: Scope::Live,
        };
        assert_eq!(usage.kind(), ErrorKind::Usage);
        assert!(usage.is_usage());
        assert_eq!(
            usage.to_string(),
            "attribute `price` of `Product` is not filterable in scope LIVE"
        );

        assert_eq!(Error::NoQueryPlan("q".into()).kind(), ErrorKind::Internal);
        assert_eq!(Error::Storage("io".into()).kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_schema_validation_message_lists_violations() {
        let error = Error::SchemaValidation(vec!["first".into(), "second".into()]);
        assert_eq!(error.kind(), ErrorKind::SchemaValidation);
        assert_eq!(error.to_string(), "schema validation failed: first; second");
    }
}
