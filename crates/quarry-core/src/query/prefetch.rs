//! Entity prefetch.
//!
//! When the filter pins the result to a small, known set of primary keys,
//! loading those entities up front can be cheaper than evaluating the
//! formula tree. Prefetched parts serve selection predicates, in-memory
//! sorting and the final fetch, so each part is read from storage once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use quarry_proto::{EntityFetch, Query, Value};
use roaring::RoaringBitmap;
use tracing::debug;

use super::context::QueryPlanningContext;
use crate::config::PrefetchConfig;
use crate::error::Error;
use crate::formula::{EntitySource, Formula};
use crate::storage::{
    AttributesPart, EntityBodyPart, EntityStoragePartAccessor, PricesPart, ReferencesPart,
};

/// Entity parts loaded ahead of filtering.
#[derive(Debug, Clone)]
pub struct PrefetchedEntity {
    pub body: EntityBodyPart,
    /// Attributes, when they were part of the requirements.
    pub attributes: Option<AttributesPart>,
    /// Loaded associated data; a `None` value means the entity has none.
    pub associated_data: BTreeMap<String, Option<Value>>,
    pub references: Option<ReferencesPart>,
    pub prices: Option<PricesPart>,
}

impl PrefetchedEntity {
    pub fn primary_key(&self) -> u32 {
        self.body.primary_key
    }
}

/// Entity parts needed by the filter, the sorters and the fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchRequirements {
    pub attributes: bool,
    pub associated_data: BTreeSet<String>,
    pub references: bool,
    pub prices: bool,
}

impl PrefetchRequirements {
    /// Requirements implied by the query's fetch and ordering.
    pub fn of_query(query: &Query) -> Self {
        let mut requirements = Self::from_fetch(query.require.entity_fetch.as_ref());
        if query
            .order
            .iter()
            .any(|o| matches!(o, quarry_proto::OrderConstraint::AttributeNatural { .. }))
        {
            requirements.attributes = true;
        }
        requirements
    }

    /// Requirements implied by an entity fetch.
    pub fn from_fetch(fetch: Option<&EntityFetch>) -> Self {
        let Some(fetch) = fetch else {
            return Self::default();
        };
        Self {
            attributes: fetch.attributes.is_requested(),
            associated_data: fetch.associated_data.iter().cloned().collect(),
            references: !fetch.references.is_empty(),
            prices: fetch.prices,
        }
    }

    /// Add associated data read by filter predicates.
    pub fn with_associated_data<'n>(mut self, names: impl IntoIterator<Item = &'n String>) -> Self {
        self.associated_data.extend(names.into_iter().cloned());
        self
    }

    /// Number of parts to load per entity besides the body.
    pub fn count(&self) -> u64 {
        self.attributes as u64
            + self.associated_data.len() as u64
            + self.references as u64
            + self.prices as u64
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Cost of prefetching `candidates` entities with `requirements` parts each.
pub fn estimate_prefetch_cost(candidates: u64, requirements: u64, config: &PrefetchConfig) -> u64 {
    candidates.saturating_mul(
        config
            .body_cost
            .saturating_add(config.requirement_cost.saturating_mul(requirements)),
    )
}

/// A decided prefetch of one collection.
#[derive(Debug, Clone)]
pub struct Prefetcher {
    collection: String,
    candidates: RoaringBitmap,
    requirements: PrefetchRequirements,
    locale: Option<String>,
    estimated_cost: u64,
}

impl Prefetcher {
    /// Decide whether prefetching `candidates` and evaluating `filter` over
    /// them beats evaluating `filter` against the indexes and storage.
    pub fn decide(
        ctx: &QueryPlanningContext<'_>,
        collection: &str,
        filter: &Formula,
        candidates: Option<&RoaringBitmap>,
        requirements: PrefetchRequirements,
    ) -> Option<Self> {
        if !ctx.allows_prefetch() || requirements.is_empty() {
            return None;
        }
        let candidates = candidates?;
        let config = &ctx.config().prefetch;
        if candidates.len() > config.max_candidates as u64 {
            return None;
        }
        let estimated_cost = estimate_prefetch_cost(candidates.len(), requirements.count(), config)
            .saturating_add(filter.estimated_cost_over_prefetched());
        let formula_cost = filter.estimated_cost();
        let preferred = ctx.flags().prefer_prefetching;
        if !preferred && estimated_cost >= formula_cost {
            debug!(
                collection,
                estimated_cost, formula_cost, "prefetch rejected as more expensive"
            );
            return None;
        }
        Some(Self {
            collection: collection.to_string(),
            candidates: candidates.clone(),
            requirements,
            locale: ctx
                .query()
                .require
                .entity_fetch
                .as_ref()
                .and_then(|f| f.locale.clone()),
            estimated_cost,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn candidates(&self) -> &RoaringBitmap {
        &self.candidates
    }

    pub fn requirements(&self) -> &PrefetchRequirements {
        &self.requirements
    }

    pub fn estimated_cost(&self) -> u64 {
        self.estimated_cost
    }

    /// Load the candidates. Bodies come in a single batch.
    pub fn prefetch(
        &self,
        storage: &dyn EntityStoragePartAccessor,
    ) -> Result<Vec<PrefetchedEntity>, Error> {
        if self.candidates.is_empty() {
            return Ok(vec![]);
        }
        let pks: Vec<u32> = self.candidates.iter().collect();
        let bodies = storage.get_entity_bodies(&self.collection, &pks)?;
        let mut entities = Vec::with_capacity(bodies.len());
        for body in bodies {
            let pk = body.primary_key;
            let attributes = if self.requirements.attributes {
                storage.get_attributes(&self.collection, pk, self.locale.as_deref())?
            } else {
                None
            };
            let mut associated_data = BTreeMap::new();
            for name in &self.requirements.associated_data {
                let value = storage
                    .get_associated_data(&self.collection, pk, name)?
                    .map(|part| part.value);
                associated_data.insert(name.clone(), value);
            }
            let references = if self.requirements.references {
                storage.get_references(&self.collection, pk)?
            } else {
                None
            };
            let prices = if self.requirements.prices {
                storage.get_prices(&self.collection, pk)?
            } else {
                None
            };
            entities.push(PrefetchedEntity {
                body,
                attributes,
                associated_data,
                references,
                prices,
            });
        }
        debug!(
            collection = %self.collection,
            requested = pks.len(),
            loaded = entities.len(),
            "prefetched entities"
        );
        Ok(entities)
    }
}

/// Entity data read straight from storage.
pub struct StorageSource {
    storage: Arc<dyn EntityStoragePartAccessor>,
    locale: Option<String>,
}

impl StorageSource {
    pub fn new(storage: Arc<dyn EntityStoragePartAccessor>, locale: Option<String>) -> Self {
        Self { storage, locale }
    }
}

impl EntitySource for StorageSource {
    fn attribute(&self, collection: &str, pk: u32, name: &str) -> Result<Option<Value>, Error> {
        Ok(self
            .storage
            .get_attributes(collection, pk, self.locale.as_deref())?
            .and_then(|part| part.get(name).cloned()))
    }

    fn associated_data(
        &self,
        collection: &str,
        pk: u32,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        Ok(self
            .storage
            .get_associated_data(collection, pk, name)?
            .map(|part| part.value))
    }
}

/// Entity data served from prefetched parts, falling back to storage for
/// anything that was not prefetched.
pub struct PrefetchedSource {
    collection: String,
    entities: Arc<HashMap<u32, Arc<PrefetchedEntity>>>,
    fallback: StorageSource,
}

impl PrefetchedSource {
    pub fn new(
        collection: impl Into<String>,
        entities: Arc<HashMap<u32, Arc<PrefetchedEntity>>>,
        fallback: StorageSource,
    ) -> Self {
        Self {
            collection: collection.into(),
            entities,
            fallback,
        }
    }

    fn entity(&self, collection: &str, pk: u32) -> Option<&PrefetchedEntity> {
        if collection != self.collection {
            return None;
        }
        self.entities.get(&pk).map(Arc::as_ref)
    }
}

impl EntitySource for PrefetchedSource {
    fn attribute(&self, collection: &str, pk: u32, name: &str) -> Result<Option<Value>, Error> {
        match self.entity(collection, pk).and_then(|e| e.attributes.as_ref()) {
            Some(attributes) => Ok(attributes.get(name).cloned()),
            None => self.fallback.attribute(collection, pk, name),
        }
    }

    fn associated_data(
        &self,
        collection: &str,
        pk: u32,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        match self
            .entity(collection, pk)
            .and_then(|e| e.associated_data.get(name))
        {
            Some(value) => Ok(value.clone()),
            None => self.fallback.associated_data(collection, pk, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EntityRecord, InMemoryStorage};

    fn storage() -> Arc<InMemoryStorage> {
        Arc::new(
            InMemoryStorage::new()
                .with(
                    EntityRecord::new("Product", 1)
                        .with_attribute("code", "A")
                        .with_associated_data("color", "red"),
                )
                .with(
                    EntityRecord::new("Product", 2)
                        .with_attribute("code", "B")
                        .with_associated_data("color", "blue"),
                )
                .with(EntityRecord::new("Product", 3).with_attribute("code", "C")),
        )
    }

    #[test]
    fn test_cost_formula() {
        let config = PrefetchConfig::default();
        assert_eq!(estimate_prefetch_cost(0, 3, &config), 0);
        assert_eq!(
            estimate_prefetch_cost(10, 2, &config),
            10 * (config.body_cost + 2 * config.requirement_cost)
        );
    }

    #[test]
    fn test_requirements_from_fetch() {
        let fetch = EntityFetch::all_attributes()
            .with_associated_data("color")
            .with_prices();
        let requirements = PrefetchRequirements::from_fetch(Some(&fetch));
        assert_eq!(requirements.count(), 3);
        assert!(PrefetchRequirements::from_fetch(None).is_empty());

        let extended = requirements.with_associated_data(&["size".to_string()]);
        assert_eq!(extended.count(), 4);
    }

    #[test]
    fn test_prefetched_source_falls_back() {
        let storage = storage();
        let prefetcher = Prefetcher {
            collection: "Product".into(),
            candidates: [1u32, 2].into_iter().collect(),
            requirements: PrefetchRequirements::default().with_associated_data(&["color".to_string()]),
            locale: None,
            estimated_cost: 0,
        };
        let entities = prefetcher.prefetch(storage.as_ref()).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(storage.batches_for("Product"), vec![2]);

        let entities: HashMap<u32, Arc<PrefetchedEntity>> = entities
            .into_iter()
            .map(|e| (e.primary_key(), Arc::new(e)))
            .collect();
        let source = PrefetchedSource::new(
            "Product",
            Arc::new(entities),
            StorageSource::new(storage.clone(), None),
        );
        assert_eq!(
            source.associated_data("Product", 2, "color").unwrap(),
            Some(Value::from("blue"))
        );
        assert_eq!(source.associated_data("Product", 3, "color").unwrap(), None);
        assert_eq!(
            source.attribute("Product", 1, "code").unwrap(),
            Some(Value::from("A"))
        );
    }
}
