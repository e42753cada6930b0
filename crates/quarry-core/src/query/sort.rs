//! Sorting and slicing of the filtered result.
//!
//! Sorters form a chain. Each sorter orders the entities it knows about
//! (those having its sort value) and hands the rest to the next one; the
//! chain always ends with primary key order so every entity gets a slot.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use quarry_proto::{OrderConstraint, OrderDirection, Value};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use roaring::RoaringBitmap;

use super::context::QueryPlanningContext;
use super::execution::QueryExecutionContext;
use crate::error::Error;
use crate::index::{sorted_entries, EntityIndex, TargetIndexes};

/// Output of one sorter.
#[derive(Debug, Clone, Default)]
pub struct SortedSlice {
    /// Requested window of the entities this sorter ordered.
    pub slice: Vec<u32>,
    /// Number of entities this sorter ordered.
    pub sorted: usize,
    /// Entities left for the next sorter.
    pub rest: RoaringBitmap,
}

/// One link of a sorter chain.
pub trait Sorter: fmt::Debug {
    /// Order what this sorter can and return the `skip..skip + take` window.
    fn sort_and_slice(
        &self,
        exec: &QueryExecutionContext<'_, '_>,
        input: &RoaringBitmap,
        skip: usize,
        take: usize,
    ) -> Result<SortedSlice, Error>;

    fn describe(&self) -> String;
}

fn window(ordered: &[u32], skip: usize, take: usize) -> Vec<u32> {
    ordered.iter().skip(skip).take(take).copied().collect()
}

/// Orders by an attribute value, ties by primary key.
#[derive(Debug)]
pub struct AttributeSorter {
    collection: String,
    attribute: String,
    direction: OrderDirection,
    localized: bool,
    indexes: Vec<Arc<EntityIndex>>,
}

impl AttributeSorter {
    /// Order of the input taken from the presorted indexes.
    fn from_indexes(&self, input: &RoaringBitmap) -> Vec<u32> {
        let sort_indexes: Vec<_> = self
            .indexes
            .iter()
            .filter_map(|index| index.sort_index(&self.attribute))
            .collect();
        if let [single] = sort_indexes.as_slice() {
            return single
                .ordered(self.direction)
                .filter(|pk| input.contains(*pk))
                .collect();
        }
        let mut entries = sorted_entries(
            sort_indexes
                .iter()
                .flat_map(|index| index.entries())
                .filter(|(_, pk)| input.contains(*pk)),
        );
        entries.dedup_by_key(|(_, pk)| *pk);
        self.directed(entries)
    }

    /// Order of prefetched entities, sorted in memory.
    fn from_prefetched(&self, exec: &QueryExecutionContext<'_, '_>, input: &RoaringBitmap) -> Vec<u32> {
        let entries = sorted_entries(input.iter().filter_map(|pk| {
            exec.prefetched(&self.collection, pk)
                .and_then(|entity| entity.attributes.as_ref())
                .and_then(|attributes| attributes.get(&self.attribute))
                .map(|value| (value, pk))
        }));
        self.directed(entries)
    }

    fn directed(&self, entries: Vec<(&Value, u32)>) -> Vec<u32> {
        let ordered = entries.into_iter().map(|(_, pk)| pk);
        match self.direction {
            OrderDirection::Asc => ordered.collect(),
            OrderDirection::Desc => ordered.rev().collect(),
        }
    }
}

impl Sorter for AttributeSorter {
    fn sort_and_slice(
        &self,
        exec: &QueryExecutionContext<'_, '_>,
        input: &RoaringBitmap,
        skip: usize,
        take: usize,
    ) -> Result<SortedSlice, Error> {
        let ordered = if !self.localized && exec.covers(input) {
            self.from_prefetched(exec, input)
        } else {
            self.from_indexes(input)
        };
        let mut rest = input.clone();
        for pk in &ordered {
            rest.remove(*pk);
        }
        Ok(SortedSlice {
            slice: window(&ordered, skip, take),
            sorted: ordered.len(),
            rest,
        })
    }

    fn describe(&self) -> String {
        format!("attribute {} {:?}", self.attribute, self.direction)
    }
}

/// Orders by primary key.
#[derive(Debug)]
pub struct PrimaryKeySorter {
    direction: OrderDirection,
}

impl PrimaryKeySorter {
    pub fn new(direction: OrderDirection) -> Self {
        Self { direction }
    }
}

impl Sorter for PrimaryKeySorter {
    fn sort_and_slice(
        &self,
        _exec: &QueryExecutionContext<'_, '_>,
        input: &RoaringBitmap,
        skip: usize,
        take: usize,
    ) -> Result<SortedSlice, Error> {
        let slice = match self.direction {
            OrderDirection::Asc => input.iter().skip(skip).take(take).collect(),
            OrderDirection::Desc => {
                let all: Vec<u32> = input.iter().collect();
                all.into_iter().rev().skip(skip).take(take).collect()
            }
        };
        Ok(SortedSlice {
            slice,
            sorted: input.len() as usize,
            rest: RoaringBitmap::new(),
        })
    }

    fn describe(&self) -> String {
        format!("primary key {:?}", self.direction)
    }
}

/// Orders masked keys by the primary key they stand for, then collection.
#[derive(Debug)]
pub struct MaskedPrimaryKeySorter {
    direction: OrderDirection,
}

impl MaskedPrimaryKeySorter {
    pub fn new(direction: OrderDirection) -> Self {
        Self { direction }
    }
}

impl Sorter for MaskedPrimaryKeySorter {
    fn sort_and_slice(
        &self,
        exec: &QueryExecutionContext<'_, '_>,
        input: &RoaringBitmap,
        skip: usize,
        take: usize,
    ) -> Result<SortedSlice, Error> {
        let ctx = exec.planning();
        let mut keyed = Vec::with_capacity(input.len() as usize);
        for id in input {
            let reference = ctx.translate_to_entity_reference(id).ok_or_else(|| {
                Error::Internal(format!("masked key {id} has no entity reference"))
            })?;
            keyed.push((reference.primary_key, reference.collection, id));
        }
        keyed.sort();
        if self.direction == OrderDirection::Desc {
            keyed.reverse();
        }
        let ordered: Vec<u32> = keyed.into_iter().map(|(_, _, id)| id).collect();
        Ok(SortedSlice {
            slice: window(&ordered, skip, take),
            sorted: ordered.len(),
            rest: RoaringBitmap::new(),
        })
    }

    fn describe(&self) -> String {
        format!("masked primary key {:?}", self.direction)
    }
}

/// Pseudo-random order from the frozen generator of the request.
pub struct RandomSorter {
    rng: StdRng,
}

impl fmt::Debug for RandomSorter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RandomSorter")
    }
}

impl Sorter for RandomSorter {
    fn sort_and_slice(
        &self,
        _exec: &QueryExecutionContext<'_, '_>,
        input: &RoaringBitmap,
        skip: usize,
        take: usize,
    ) -> Result<SortedSlice, Error> {
        let mut ordered: Vec<u32> = input.iter().collect();
        let mut rng = self.rng.clone();
        ordered.shuffle(&mut rng);
        Ok(SortedSlice {
            slice: window(&ordered, skip, take),
            sorted: ordered.len(),
            rest: RoaringBitmap::new(),
        })
    }

    fn describe(&self) -> String {
        "random".into()
    }
}

/// Sorters applied in order, ending with primary key order.
#[derive(Debug, Clone)]
pub struct SorterChain {
    sorters: Vec<Rc<dyn Sorter>>,
}

impl SorterChain {
    pub fn new(sorters: Vec<Rc<dyn Sorter>>) -> Self {
        Self { sorters }
    }

    pub fn len(&self) -> usize {
        self.sorters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorters.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.sorters.iter().map(|s| s.describe()).collect()
    }

    /// Ordered window `offset..offset + limit` of the input.
    pub fn sort_and_slice(
        &self,
        exec: &QueryExecutionContext<'_, '_>,
        input: &RoaringBitmap,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<u32>, Error> {
        let mut result = Vec::with_capacity(limit.min(input.len() as usize));
        let mut remaining = input.clone();
        let mut skip = offset;
        let mut take = limit;
        for sorter in &self.sorters {
            if remaining.is_empty() || take == 0 {
                break;
            }
            let SortedSlice {
                slice,
                sorted,
                rest,
            } = sorter.sort_and_slice(exec, &remaining, skip, take)?;
            skip = skip.saturating_sub(sorted);
            take -= slice.len().min(take);
            result.extend(slice);
            remaining = rest;
        }
        Ok(result)
    }
}

/// Builds the sorter chain of a query for a target candidate.
pub struct OrderByVisitor;

impl OrderByVisitor {
    pub fn build(
        ctx: &QueryPlanningContext<'_>,
        target: &TargetIndexes,
    ) -> Result<SorterChain, Error> {
        let masking = ctx.is_masking();
        let mut sorters: Vec<Rc<dyn Sorter>> = vec![];
        for order in &ctx.query().order {
            match order {
                OrderConstraint::AttributeNatural { name, direction } => {
                    let collection = ctx.require_collection("ordering by attribute")?;
                    let attribute = ctx.catalog().attribute(collection, name)?.def();
                    for scope in ctx.scopes() {
                        if !attribute.is_sortable(*scope) {
                            return Err(Error::AttributeNotSortable {
                                attribute: name.clone(),
                                collection: collection.to_string(),
                                scope: *scope,
                            });
                        }
                    }
                    sorters.push(Rc::new(AttributeSorter {
                        collection: collection.to_string(),
                        attribute: name.clone(),
                        direction: *direction,
                        localized: attribute.localized,
                        indexes: target.globals().to_vec(),
                    }));
                }
                OrderConstraint::PrimaryKeyNatural(direction) => {
                    if masking {
                        sorters.push(Rc::new(MaskedPrimaryKeySorter::new(*direction)));
                    } else {
                        sorters.push(Rc::new(PrimaryKeySorter::new(*direction)));
                    }
                }
                OrderConstraint::Random => sorters.push(Rc::new(RandomSorter {
                    rng: ctx.random_generator(),
                })),
            }
        }
        if masking {
            sorters.push(Rc::new(MaskedPrimaryKeySorter::new(OrderDirection::Asc)));
        } else {
            sorters.push(Rc::new(PrimaryKeySorter::new(OrderDirection::Asc)));
        }
        Ok(SorterChain::new(sorters))
    }
}

/// Rank of every primary key in an ordered list.
pub fn rank_of(ordered: &[u32]) -> HashMap<u32, usize> {
    ordered
        .iter()
        .enumerate()
        .map(|(rank, pk)| (*pk, rank))
        .collect()
}

/// Compare by rank; unranked keys go last in primary key order.
pub fn compare_by_rank(ranks: &HashMap<u32, usize>, a: u32, b: u32) -> Ordering {
    match (ranks.get(&a), ranks.get(&b)) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window() {
        assert_eq!(window(&[5, 3, 9, 1], 1, 2), vec![3, 9]);
        assert!(window(&[5, 3], 4, 2).is_empty());
    }

    #[test]
    fn test_rank_ordering() {
        let ranks = rank_of(&[9, 4, 7]);
        let mut keys = vec![1, 7, 4, 9, 2];
        keys.sort_by(|a, b| compare_by_rank(&ranks, *a, *b));
        assert_eq!(keys, vec![9, 4, 7, 1, 2]);
    }
}
