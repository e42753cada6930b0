//! Attribute indexes: value-keyed filter, sort and unique indexes.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use quarry_proto::{OrderDirection, Value};
use roaring::RoaringBitmap;

/// Totally ordered wrapper around [`Value`] usable as an index key.
///
/// Numeric values of different widths compare equal when they represent the
/// same number, so `Int32(5)` and `Int64(5)` share one index bucket.
#[derive(Debug, Clone)]
pub struct ValueKey(pub Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for ValueKey {}

impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Inverted index from attribute value to entity primary keys.
///
/// Array values index each element separately. Nulls are not indexed.
#[derive(Debug, Clone, Default)]
pub struct FilterIndex {
    values: BTreeMap<ValueKey, RoaringBitmap>,
}

impl FilterIndex {
    /// Index the value of an entity.
    pub fn insert(&mut self, value: &Value, pk: u32) {
        for scalar in value.scalars() {
            if scalar.is_null() {
                continue;
            }
            self.values.entry(ValueKey(scalar)).or_default().insert(pk);
        }
    }

    /// Entities whose value equals (or, for arrays, contains) the value.
    pub fn equals(&self, value: &Value) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for scalar in value.scalars() {
            if let Some(bitmap) = self.values.get(&ValueKey(scalar)) {
                result |= bitmap;
            }
        }
        result
    }

    /// Entities whose value equals any of the values.
    pub fn in_set(&self, values: &[Value]) -> RoaringBitmap {
        values.iter().fold(RoaringBitmap::new(), |mut acc, v| {
            acc |= self.equals(v);
            acc
        })
    }

    /// Entities whose value lies within the bounds.
    pub fn range(&self, from: Bound<&Value>, to: Bound<&Value>) -> RoaringBitmap {
        // BTreeMap::range panics on inverted or empty-exclusive bounds.
        if let (
            Bound::Included(a) | Bound::Excluded(a),
            Bound::Included(b) | Bound::Excluded(b),
        ) = (from, to)
        {
            match a.total_cmp(b) {
                Ordering::Greater => return RoaringBitmap::new(),
                Ordering::Equal
                    if !matches!((from, to), (Bound::Included(_), Bound::Included(_))) =>
                {
                    return RoaringBitmap::new()
                }
                _ => {}
            }
        }
        let owned = |b: Bound<&Value>| match b {
            Bound::Included(v) => Bound::Included(ValueKey(v.clone())),
            Bound::Excluded(v) => Bound::Excluded(ValueKey(v.clone())),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.values
            .range((owned(from), owned(to)))
            .fold(RoaringBitmap::new(), |mut acc, (_, bitmap)| {
                acc |= bitmap;
                acc
            })
    }

    /// Entities having any value.
    pub fn all(&self) -> RoaringBitmap {
        self.values
            .values()
            .fold(RoaringBitmap::new(), |mut acc, bitmap| {
                acc |= bitmap;
                acc
            })
    }

    /// Number of distinct values.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }
}

/// Entities ordered by attribute value, ties by primary key.
#[derive(Debug, Clone, Default)]
pub struct SortIndex {
    entries: Vec<(ValueKey, u32)>,
    members: RoaringBitmap,
}

impl SortIndex {
    /// Build from unordered `(value, pk)` pairs, see [`sorted_entries`].
    pub fn from_entries(entries: impl IntoIterator<Item = (Value, u32)>) -> Self {
        let entries: Vec<(ValueKey, u32)> = sorted_entries(entries)
            .into_iter()
            .map(|(v, pk)| (ValueKey(v), pk))
            .collect();
        let members = entries.iter().map(|(_, pk)| *pk).collect();
        Self { entries, members }
    }

    /// Primary keys in the requested direction.
    pub fn ordered(&self, direction: OrderDirection) -> Box<dyn Iterator<Item = u32> + '_> {
        match direction {
            OrderDirection::Asc => Box::new(self.entries.iter().map(|(_, pk)| *pk)),
            OrderDirection::Desc => Box::new(self.entries.iter().rev().map(|(_, pk)| *pk)),
        }
    }

    /// Values with their primary keys in ascending order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = (&Value, u32)> + '_ {
        self.entries.iter().map(|(value, pk)| (&value.0, *pk))
    }

    /// Entities present in the index.
    pub fn members(&self) -> &RoaringBitmap {
        &self.members
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ascending `(value, pk)` entries. Entities whose value is null are left
/// out, so a sorter hands them on to the next one in the chain.
pub fn sorted_entries<V: Borrow<Value>>(
    entries: impl IntoIterator<Item = (V, u32)>,
) -> Vec<(V, u32)> {
    let mut entries: Vec<(V, u32)> = entries
        .into_iter()
        .filter(|(v, _)| !v.borrow().is_null())
        .collect();
    entries.sort_by(|a, b| compare_sort_entries(a.0.borrow(), a.1, b.0.borrow(), b.1));
    entries
}

/// Ascending comparison of sort entries; descending order is its reverse.
pub fn compare_sort_entries(a: &Value, a_pk: u32, b: &Value, b_pk: u32) -> Ordering {
    a.total_cmp(b).then(a_pk.cmp(&b_pk))
}

/// Unique attribute value to primary key.
#[derive(Debug, Clone, Default)]
pub struct UniqueIndex {
    values: BTreeMap<ValueKey, u32>,
}

impl UniqueIndex {
    /// Register a value. Returns the previous owner when the value is taken.
    pub fn insert(&mut self, value: &Value, pk: u32) -> Option<u32> {
        if value.is_null() {
            return None;
        }
        let key = ValueKey(value.clone());
        if let Some(existing) = self.values.get(&key) {
            return (*existing != pk).then_some(*existing);
        }
        self.values.insert(key, pk);
        None
    }

    /// Owner of the value.
    pub fn get(&self, value: &Value) -> Option<u32> {
        self.values.get(&ValueKey(value.clone())).copied()
    }

    /// Owners of the values.
    pub fn get_all(&self, values: &[Value]) -> RoaringBitmap {
        values.iter().filter_map(|v| self.get(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_index() -> FilterIndex {
        let mut index = FilterIndex::default();
        index.insert(&Value::Int64(10), 1);
        index.insert(&Value::Int32(15), 2);
        index.insert(&Value::Float64(20.5), 3);
        index.insert(&Value::Int64(15), 4);
        index.insert(&Value::Null, 5);
        index
    }

    #[test]
    fn test_equals_across_numeric_widths() {
        let index = price_index();
        let result = index.equals(&Value::Int64(15));
        assert_eq!(result.iter().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(index.value_count(), 3);
    }

    #[test]
    fn test_range_bounds() {
        let index = price_index();
        let ten = Value::Int64(10);
        let twenty = Value::Int64(20);
        let result = index.range(Bound::Excluded(&ten), Bound::Excluded(&twenty));
        assert_eq!(result.iter().collect::<Vec<_>>(), vec![2, 4]);

        let result = index.range(Bound::Included(&ten), Bound::Unbounded);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let index = price_index();
        let a = Value::Int64(20);
        let b = Value::Int64(10);
        assert!(index.range(Bound::Included(&a), Bound::Included(&b)).is_empty());
        assert!(index.range(Bound::Excluded(&b), Bound::Excluded(&b)).is_empty());
        assert_eq!(index.range(Bound::Included(&b), Bound::Included(&b)).len(), 1);
    }

    #[test]
    fn test_arrays_index_elements() {
        let mut index = FilterIndex::default();
        index.insert(&Value::StringArray(vec!["red".into(), "blue".into()]), 7);
        assert!(index.equals(&Value::String("blue".into())).contains(7));
        assert!(index.all().contains(7));
    }

    #[test]
    fn test_sort_index_order() {
        let index = SortIndex::from_entries(vec![
            (Value::String("b".into()), 1),
            (Value::String("a".into()), 3),
            (Value::String("a".into()), 2),
            (Value::Null, 4),
        ]);
        assert_eq!(index.ordered(OrderDirection::Asc).collect::<Vec<_>>(), vec![2, 3, 1]);
        assert_eq!(index.ordered(OrderDirection::Desc).collect::<Vec<_>>(), vec![1, 3, 2]);
        assert!(!index.members().contains(4));
    }

    #[test]
    fn test_borrowed_entries_follow_index_order() {
        let values = [
            Value::from(7i64),
            Value::Null,
            Value::from(3i64),
            Value::from(7i64),
        ];
        let borrowed = sorted_entries(values.iter().zip([5u32, 1, 9, 2]));
        assert_eq!(
            borrowed.iter().map(|(_, pk)| *pk).collect::<Vec<_>>(),
            vec![9, 2, 5]
        );

        let index = SortIndex::from_entries(values.iter().cloned().zip([5u32, 1, 9, 2]));
        assert_eq!(
            index.ordered(OrderDirection::Asc).collect::<Vec<_>>(),
            vec![9, 2, 5]
        );
    }

    #[test]
    fn test_unique_index_conflicts() {
        let mut index = UniqueIndex::default();
        assert_eq!(index.insert(&Value::from("ABC"), 1), None);
        assert_eq!(index.insert(&Value::from("ABC"), 2), Some(1));
        assert_eq!(index.get(&Value::from("ABC")), Some(1));
        assert!(index.get(&Value::from("XYZ")).is_none());
    }
}
