//! Attribute schema descriptors.

use quarry_proto::{Scope, Value};

/// Type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// Boolean.
    Bool,
    /// Integer (32 or 64 bit).
    Int,
    /// Floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Binary data.
    Bytes,
    /// Microseconds since Unix epoch.
    Timestamp,
    /// Array of integers.
    IntArray,
    /// Array of strings.
    StringArray,
}

impl AttributeType {
    /// Check whether a value is acceptable for this type (null always is).
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (AttributeType::Bool, Value::Bool(_))
                | (AttributeType::Int, Value::Int32(_) | Value::Int64(_))
                | (
                    AttributeType::Float,
                    Value::Float64(_) | Value::Int32(_) | Value::Int64(_)
                )
                | (AttributeType::String, Value::String(_))
                | (AttributeType::Bytes, Value::Bytes(_))
                | (AttributeType::Timestamp, Value::Timestamp(_))
                | (AttributeType::IntArray, Value::Int64Array(_))
                | (AttributeType::StringArray, Value::StringArray(_))
        )
    }

    /// Whether values of this type are arrays.
    pub fn is_array(&self) -> bool {
        matches!(self, AttributeType::IntArray | AttributeType::StringArray)
    }
}

/// Common attribute definition.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    /// Attribute name.
    pub name: String,
    /// Value type.
    pub value_type: AttributeType,
    /// Whether values differ per locale.
    pub localized: bool,
    /// Scopes in which the attribute is filterable.
    pub filterable_in: Vec<Scope>,
    /// Scopes in which the attribute is sortable.
    pub sortable_in: Vec<Scope>,
    /// Scopes in which the attribute is unique within its collection.
    pub unique_in: Vec<Scope>,
}

impl AttributeDef {
    /// Create a plain, non-indexed attribute.
    pub fn new(name: impl Into<String>, value_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            value_type,
            localized: false,
            filterable_in: vec![],
            sortable_in: vec![],
            unique_in: vec![],
        }
    }

    /// Make the attribute filterable in the live scope.
    pub fn filterable(mut self) -> Self {
        push_scope(&mut self.filterable_in, Scope::Live);
        self
    }

    /// Make the attribute sortable in the live scope.
    pub fn sortable(mut self) -> Self {
        push_scope(&mut self.sortable_in, Scope::Live);
        self
    }

    /// Make the attribute unique (and thereby filterable) in the live scope.
    pub fn unique(mut self) -> Self {
        push_scope(&mut self.unique_in, Scope::Live);
        push_scope(&mut self.filterable_in, Scope::Live);
        self
    }

    /// Make the attribute localized.
    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    /// Copy every live-scope trait into the archived scope as well.
    pub fn indexed_in_archive(mut self) -> Self {
        for scopes in [
            &mut self.filterable_in,
            &mut self.sortable_in,
            &mut self.unique_in,
        ] {
            if scopes.contains(&Scope::Live) {
                push_scope(scopes, Scope::Archived);
            }
        }
        self
    }

    /// Whether the attribute is filterable in the scope.
    pub fn is_filterable(&self, scope: Scope) -> bool {
        self.filterable_in.contains(&scope) || self.unique_in.contains(&scope)
    }

    /// Whether the attribute is sortable in the scope.
    pub fn is_sortable(&self, scope: Scope) -> bool {
        self.sortable_in.contains(&scope)
    }

    /// Whether the attribute is unique in the scope.
    pub fn is_unique(&self, scope: Scope) -> bool {
        self.unique_in.contains(&scope)
    }
}

fn push_scope(scopes: &mut Vec<Scope>, scope: Scope) {
    if !scopes.contains(&scope) {
        scopes.push(scope);
        scopes.sort();
    }
}

/// Attribute owned by a single entity collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityAttributeSchema {
    /// Attribute definition.
    pub def: AttributeDef,
    /// Whether the attribute identifies the entity for humans.
    pub representative: bool,
}

/// Attribute shared by every collection of the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalAttributeSchema {
    /// Attribute definition.
    pub def: AttributeDef,
    /// Scopes in which values are unique across all collections.
    pub globally_unique_in: Vec<Scope>,
}

/// Attribute schema of an entity collection.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeSchema {
    /// Collection-local attribute.
    Entity(EntityAttributeSchema),
    /// Catalog-wide attribute.
    Global(GlobalAttributeSchema),
}

impl AttributeSchema {
    /// Collection-local attribute.
    pub fn entity(def: AttributeDef) -> Self {
        AttributeSchema::Entity(EntityAttributeSchema {
            def,
            representative: false,
        })
    }

    /// Catalog-wide attribute, globally unique in the live scope.
    pub fn globally_unique(def: AttributeDef) -> Self {
        let def = def.unique();
        AttributeSchema::Global(GlobalAttributeSchema {
            def,
            globally_unique_in: vec![Scope::Live],
        })
    }

    /// The attribute definition.
    pub fn def(&self) -> &AttributeDef {
        match self {
            AttributeSchema::Entity(a) => &a.def,
            AttributeSchema::Global(a) => &a.def,
        }
    }

    /// Attribute name.
    pub fn name(&self) -> &str {
        &self.def().name
    }

    /// Whether values are unique across the whole catalog in the scope.
    pub fn is_globally_unique(&self, scope: Scope) -> bool {
        match self {
            AttributeSchema::Entity(_) => false,
            AttributeSchema::Global(a) => a.globally_unique_in.contains(&scope),
        }
    }
}

/// Associated data schema. Associated data is never indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociatedDataSchema {
    /// Key name.
    pub name: String,
    /// Whether values differ per locale.
    pub localized: bool,
}

impl AssociatedDataSchema {
    /// Create an associated data schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            localized: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_implies_filterable() {
        let def = AttributeDef::new("code", AttributeType::String).unique();
        assert!(def.is_unique(Scope::Live));
        assert!(def.is_filterable(Scope::Live));
        assert!(!def.is_filterable(Scope::Archived));
        assert!(!def.is_sortable(Scope::Live));
    }

    #[test]
    fn test_indexed_in_archive_copies_traits() {
        let def = AttributeDef::new("name", AttributeType::String)
            .sortable()
            .indexed_in_archive();
        assert!(def.is_sortable(Scope::Archived));
        assert!(!def.is_filterable(Scope::Archived));
    }

    #[test]
    fn test_type_acceptance() {
        assert!(AttributeType::Float.accepts(&Value::Int32(1)));
        assert!(AttributeType::String.accepts(&Value::Null));
        assert!(!AttributeType::Int.accepts(&Value::String("1".into())));
    }

    #[test]
    fn test_global_attribute() {
        let attr =
            AttributeSchema::globally_unique(AttributeDef::new("url", AttributeType::String));
        assert!(attr.is_globally_unique(Scope::Live));
        assert!(attr.def().is_filterable(Scope::Live));
        assert_eq!(attr.name(), "url");
    }
}
