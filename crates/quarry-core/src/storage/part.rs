//! Storage parts returned by the storage accessor.

use std::collections::BTreeMap;

use quarry_proto::{Price, Scope, Value};

/// Core of a stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityBodyPart {
    /// Collection.
    pub collection: String,
    /// Primary key.
    pub primary_key: u32,
    /// Scope the entity lives in.
    pub scope: Scope,
    /// Parent in the self hierarchy.
    pub parent: Option<u32>,
    /// Locales the entity has localized values for.
    pub locales: Vec<String>,
}

/// Attribute values of an entity, localized values already resolved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributesPart {
    /// Values by attribute name.
    pub values: BTreeMap<String, Value>,
}

impl AttributesPart {
    /// Value of the attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// One associated data value.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociatedDataPart {
    /// Key name.
    pub name: String,
    /// Value.
    pub value: Value,
}

/// A stored reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePart {
    /// Reference name.
    pub name: String,
    /// Referenced primary key.
    pub referenced_primary_key: u32,
    /// Group primary key.
    pub group: Option<u32>,
    /// Attributes of the reference.
    pub attributes: BTreeMap<String, Value>,
}

impl ReferencePart {
    /// Create a reference without attributes.
    pub fn new(name: impl Into<String>, referenced_primary_key: u32) -> Self {
        Self {
            name: name.into(),
            referenced_primary_key,
            group: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the group.
    pub fn with_group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }

    /// Add a reference attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// All references of an entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReferencesPart {
    /// References ordered by name and referenced key.
    pub references: Vec<ReferencePart>,
}

impl ReferencesPart {
    /// References of the given name.
    pub fn of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ReferencePart> + 'a {
        self.references.iter().filter(move |r| r.name == name)
    }
}

/// Prices of an entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PricesPart {
    /// Prices.
    pub prices: Vec<Price>,
}
