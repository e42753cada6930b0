//! Response types returned by query execution.

use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::error::Error;
use crate::query::Scope;
use crate::telemetry::QueryTelemetry;
use crate::value::Value;

/// Lightweight pointer to an entity.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct EntityReference {
    /// Collection the entity belongs to.
    pub collection: String,
    /// Primary key within the collection.
    pub primary_key: u32,
}

impl EntityReference {
    /// Create a new entity reference.
    pub fn new(collection: impl Into<String>, primary_key: u32) -> Self {
        Self {
            collection: collection.into(),
            primary_key,
        }
    }
}

/// A price attached to an entity.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct Price {
    /// Price identifier.
    pub price_id: u32,
    /// Price list the price belongs to.
    pub price_list: String,
    /// ISO currency code.
    pub currency: String,
    /// Amount with tax in minor units.
    pub price_with_tax: i64,
}

/// A fully materialized, read-only entity.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct SealedEntity {
    /// Collection the entity belongs to.
    pub collection: String,
    /// Primary key.
    pub primary_key: u32,
    /// Scope the entity was found in.
    pub scope: Scope,
    /// Locale used to resolve localized attributes.
    pub locale: Option<String>,
    /// Fetched attributes.
    pub attributes: BTreeMap<String, Value>,
    /// Fetched associated data.
    pub associated_data: BTreeMap<String, Value>,
    /// Fetched references grouped by reference name.
    pub references: BTreeMap<String, Vec<ReferenceOutput>>,
    /// Hierarchy parent chain.
    pub parent: ParentEntity,
    /// Fetched prices.
    pub prices: Vec<Price>,
}

impl SealedEntity {
    /// Create an entity with an empty body.
    pub fn new(collection: impl Into<String>, primary_key: u32, scope: Scope) -> Self {
        Self {
            collection: collection.into(),
            primary_key,
            scope,
            locale: None,
            attributes: BTreeMap::new(),
            associated_data: BTreeMap::new(),
            references: BTreeMap::new(),
            parent: ParentEntity::None,
            prices: vec![],
        }
    }

    /// Reference to this entity.
    pub fn reference(&self) -> EntityReference {
        EntityReference::new(self.collection.clone(), self.primary_key)
    }

    /// Get an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Get fetched references of the given name (empty when none are visible).
    pub fn references_of(&self, name: &str) -> &[ReferenceOutput] {
        self.references.get(name).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Primary keys of the parent chain from the closest parent to the root.
    pub fn parent_chain(&self) -> Vec<u32> {
        let mut chain = vec![];
        let mut current = &self.parent;
        while let ParentEntity::Parent(node) = current {
            match node.as_ref() {
                ParentNode::Reference { reference, parent } => {
                    chain.push(reference.primary_key);
                    current = parent;
                }
                ParentNode::Entity(entity) => {
                    chain.push(entity.primary_key);
                    current = &entity.parent;
                }
            }
        }
        chain
    }
}

/// A fetched reference of an entity.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct ReferenceOutput {
    /// Referenced entity.
    pub referenced: EntityReference,
    /// Reference group, if any.
    pub group: Option<EntityReference>,
    /// Attributes of the reference itself.
    pub attributes: BTreeMap<String, Value>,
    /// Body of the referenced entity, when requested and visible.
    pub entity: Option<Box<SealedEntity>>,
    /// Body of the group entity, when requested.
    pub group_entity: Option<Box<SealedEntity>>,
}

/// Hierarchy parent of an entity.
#[derive(Debug, Clone, PartialEq, Default, SerdeSerialize, SerdeDeserialize)]
pub enum ParentEntity {
    /// The entity is a root or parents were not requested.
    #[default]
    None,
    /// The parent exists but is not visible under the current request.
    Concealed,
    /// The parent node.
    Parent(Box<ParentNode>),
}

/// A node of the parent chain.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub enum ParentNode {
    /// Lightweight parent with its own parent chain.
    Reference {
        reference: EntityReference,
        parent: ParentEntity,
    },
    /// Parent body; its chain continues in [`SealedEntity::parent`].
    Entity(SealedEntity),
}

/// A single attribute entry of a binary entity body.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct AttributeEntry {
    /// Attribute name.
    pub name: String,
    /// Attribute value.
    pub value: Value,
}

/// Flat entity body encoded with rkyv for binary responses.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct BinaryEntity {
    /// Collection the entity belongs to.
    pub collection: String,
    /// Primary key.
    pub primary_key: u32,
    /// Scope the entity was found in.
    pub scope: Scope,
    /// Attributes.
    pub attributes: Vec<AttributeEntry>,
    /// Associated data.
    pub associated_data: Vec<AttributeEntry>,
    /// Prices.
    pub prices: Vec<Price>,
}

impl BinaryEntity {
    /// Flatten a sealed entity. References and parents are not carried.
    pub fn from_sealed(entity: &SealedEntity) -> Self {
        let entries = |map: &BTreeMap<String, Value>| {
            map.iter()
                .map(|(name, value)| AttributeEntry {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect()
        };
        Self {
            collection: entity.collection.clone(),
            primary_key: entity.primary_key,
            scope: entity.scope,
            attributes: entries(&entity.attributes),
            associated_data: entries(&entity.associated_data),
            prices: entity.prices.clone(),
        }
    }

    /// Encode to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidMessage("empty entity body".into()));
        }
        // rkyv requires aligned input; response bodies are plain byte vectors.
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// An item of the returned page.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub enum ResponseItem {
    /// Bare reference.
    Reference(EntityReference),
    /// Structured body.
    Entity(SealedEntity),
    /// Binary-encoded body (see [`BinaryEntity`]).
    Binary(Vec<u8>),
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct DataChunk {
    /// Items of the page.
    pub items: Vec<ResponseItem>,
    /// Number of entities matching the filter.
    pub total_record_count: u64,
    /// Offset of the first item.
    pub offset: usize,
    /// Requested page size.
    pub limit: usize,
}

impl DataChunk {
    /// Create an empty page.
    pub fn empty(offset: usize, limit: usize) -> Self {
        Self {
            items: vec![],
            total_record_count: 0,
            offset,
            limit,
        }
    }

    /// Whether the page has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether more records follow this page.
    pub fn has_next(&self) -> bool {
        self.offset.saturating_add(self.items.len()) < self.total_record_count as usize
    }

    /// Primary keys of the page items (binary items are decoded).
    pub fn primary_keys(&self) -> Vec<u32> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ResponseItem::Reference(r) => Some(r.primary_key),
                ResponseItem::Entity(e) => Some(e.primary_key),
                ResponseItem::Binary(bytes) => {
                    BinaryEntity::from_bytes(bytes).ok().map(|b| b.primary_key)
                }
            })
            .collect()
    }

    /// Structured entities of the page.
    pub fn entities(&self) -> Vec<&SealedEntity> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ResponseItem::Entity(e) => Some(e),
                _ => None,
            })
            .collect()
    }
}

/// Count of entities referencing one facet.
#[derive(Debug, Clone, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub struct FacetStatistics {
    /// Referenced primary key.
    pub facet: u32,
    /// Number of filtered entities referencing it.
    pub count: u64,
}

/// Facets sharing the same reference group.
#[derive(Debug, Clone, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub struct FacetGroupStatistics {
    /// Group primary key (`None` for ungrouped facets).
    pub group: Option<u32>,
    /// Facets ordered by primary key.
    pub facets: Vec<FacetStatistics>,
}

/// Facet counts of one reference.
#[derive(Debug, Clone, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
pub struct FacetSummary {
    /// Reference name.
    pub reference: String,
    /// Groups ordered by group key, ungrouped first.
    pub groups: Vec<FacetGroupStatistics>,
}

impl FacetSummary {
    /// Count for the facet regardless of its group.
    pub fn count_of(&self, facet: u32) -> Option<u64> {
        self.groups
            .iter()
            .flat_map(|g| g.facets.iter())
            .find(|f| f.facet == facet)
            .map(|f| f.count)
    }
}

/// An extra result computed along with the page.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub enum ExtraResult {
    /// Facet counts.
    FacetSummary(FacetSummary),
    /// Phase timings.
    QueryTelemetry(QueryTelemetry),
}

/// Response of an entity query.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct EntityResponse {
    /// Requested page.
    pub page: DataChunk,
    /// Extra results.
    pub extra_results: Vec<ExtraResult>,
}

impl EntityResponse {
    /// Total number of matching records.
    pub fn total_record_count(&self) -> u64 {
        self.page.total_record_count
    }

    /// Facet summary of the reference, if requested.
    pub fn facet_summary(&self, reference: &str) -> Option<&FacetSummary> {
        self.extra_results.iter().find_map(|r| match r {
            ExtraResult::FacetSummary(s) if s.reference == reference => Some(s),
            _ => None,
        })
    }

    /// Query telemetry, if requested.
    pub fn telemetry(&self) -> Option<&QueryTelemetry> {
        self.extra_results.iter().find_map(|r| match r {
            ExtraResult::QueryTelemetry(t) => Some(t),
            _ => None,
        })
    }

    /// Compare two responses ignoring timing-dependent extra results.
    pub fn same_content(&self, other: &EntityResponse) -> bool {
        let stable = |results: &[ExtraResult]| -> Vec<ExtraResult> {
            results
                .iter()
                .filter(|r| !matches!(r, ExtraResult::QueryTelemetry(_)))
                .cloned()
                .collect()
        };
        self.page == other.page && stable(&self.extra_results) == stable(&other.extra_results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entity() -> SealedEntity {
        let mut entity = SealedEntity::new("Product", 7, Scope::Live);
        entity
            .attributes
            .insert("code".into(), Value::String("ABC".into()));
        entity.attributes.insert("price".into(), Value::Int64(1250));
        entity.prices.push(Price {
            price_id: 1,
            price_list: "basic".into(),
            currency: "EUR".into(),
            price_with_tax: 1500,
        });
        entity
    }

    #[test]
    fn test_binary_entity_roundtrip() {
        let binary = BinaryEntity::from_sealed(&sample_entity());
        let bytes = binary.to_bytes().unwrap();
        let decoded = BinaryEntity::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, binary);
        assert_eq!(decoded.attributes[0].name, "code");
        assert_eq!(decoded.prices.len(), 1);
    }

    #[test]
    fn test_binary_entity_rejects_empty_body() {
        assert!(matches!(
            BinaryEntity::from_bytes(&[]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parent_chain() {
        let root = ParentEntity::Parent(Box::new(ParentNode::Reference {
            reference: EntityReference::new("Category", 1),
            parent: ParentEntity::None,
        }));
        let mut middle = SealedEntity::new("Category", 2, Scope::Live);
        middle.parent = root;
        let mut leaf = SealedEntity::new("Category", 3, Scope::Live);
        leaf.parent = ParentEntity::Parent(Box::new(ParentNode::Entity(middle)));

        assert_eq!(leaf.parent_chain(), vec![2, 1]);
    }

    #[test]
    fn test_data_chunk_paging() {
        let chunk = DataChunk {
            items: vec![
                ResponseItem::Reference(EntityReference::new("Product", 1)),
                ResponseItem::Entity(sample_entity()),
            ],
            total_record_count: 5,
            offset: 0,
            limit: 2,
        };
        assert!(chunk.has_next());
        assert_eq!(chunk.primary_keys(), vec![1, 7]);
        assert_eq!(chunk.entities().len(), 1);
    }

    #[test]
    fn test_same_content_ignores_telemetry() {
        let page = DataChunk::empty(0, 20);
        let mut first = EntityResponse {
            page: page.clone(),
            extra_results: vec![],
        };
        let second = first.clone();
        let mut telemetry =
            QueryTelemetry::new(crate::telemetry::QueryPhase::Overall, vec![]);
        telemetry.spent_nanos = 42;
        first
            .extra_results
            .push(ExtraResult::QueryTelemetry(telemetry));

        assert!(first.same_content(&second));
        assert_ne!(first, second);
    }
}
