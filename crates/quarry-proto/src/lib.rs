//! Quarry query object model and response types.
//!
//! This crate defines what crosses the boundary of the query engine: the
//! declarative query (filter, order and require constraints), the response
//! shapes and the recorded telemetry.
//!
//! # Modules
//!
//! - [`value`] - Runtime attribute and constraint argument values
//! - [`query`] - Query constraint trees
//! - [`result`] - Response pages, entity bodies and extra results
//! - [`telemetry`] - Phase timings of a request
//! - [`error`] - Protocol error types
//!
//! # Binary bodies
//!
//! When a query asks for binary output, every entity of the page is encoded
//! as a [`BinaryEntity`] using rkyv:
//!
//! ```ignore
//! use quarry_proto::BinaryEntity;
//!
//! let bytes = BinaryEntity::from_sealed(&entity).to_bytes()?;
//! let decoded = BinaryEntity::from_bytes(&bytes)?;
//! ```

pub mod error;
pub mod query;
pub mod result;
pub mod telemetry;
pub mod value;

pub use error::Error;

pub use query::{
    AttributeContent, DebugFlags, EntityFetch, ExtraResultRequest, FilterBy, FilterConstraint,
    HierarchyContent, HierarchyStopAt, ManagedReferencesBehaviour, OrderConstraint,
    OrderDirection, Pagination, Query, ReferenceContent, ReferenceOrder, Require, Scope,
};
pub use result::{
    AttributeEntry, BinaryEntity, DataChunk, EntityReference, EntityResponse, ExtraResult,
    FacetGroupStatistics, FacetStatistics, FacetSummary, ParentEntity, ParentNode, Price,
    ReferenceOutput, ResponseItem, SealedEntity,
};
pub use telemetry::{QueryPhase, QueryTelemetry};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip() {
        let value = Value::String("hello".into());
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&value).unwrap();
        let archived =
            rkyv::access::<value::ArchivedValue, rkyv::rancor::Error>(&bytes).unwrap();
        let deserialized: Value =
            rkyv::deserialize::<Value, rkyv::rancor::Error>(archived).unwrap();
        assert_eq!(value, deserialized);
    }

    #[test]
    fn test_query_serializes_to_json() {
        let query = Query::new("Product")
            .with_filter(FilterConstraint::attribute_equals("code", "ABC"));
        let json = serde_json::to_string(&query).unwrap();
        let decoded: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, query);
    }
}
