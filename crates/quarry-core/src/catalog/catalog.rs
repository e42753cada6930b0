//! Catalog of entity collection schemas.

use std::collections::BTreeMap;

use convert_case::{Case, Casing};
use quarry_proto::Scope;

use super::attribute::AttributeSchema;
use super::entity::EntitySchema;
use super::reference::{ReferenceSchema, ResolvedReference};
use crate::error::Error;

/// Naming convention under which schema names may be looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingConvention {
    /// `camelCase`
    Camel,
    /// `PascalCase`
    Pascal,
    /// `snake_case`
    Snake,
    /// `UPPER_SNAKE_CASE`
    UpperSnake,
    /// `kebab-case`
    Kebab,
}

impl NamingConvention {
    /// Every supported convention.
    pub const ALL: [NamingConvention; 5] = [
        NamingConvention::Camel,
        NamingConvention::Pascal,
        NamingConvention::Snake,
        NamingConvention::UpperSnake,
        NamingConvention::Kebab,
    ];

    /// Render a name in this convention.
    pub fn apply(&self, name: &str) -> String {
        match self {
            NamingConvention::Camel => name.to_case(Case::Camel),
            NamingConvention::Pascal => name.to_case(Case::Pascal),
            NamingConvention::Snake => name.to_case(Case::Snake),
            NamingConvention::UpperSnake => name.to_case(Case::UpperSnake),
            NamingConvention::Kebab => name.to_case(Case::Kebab),
        }
    }
}

/// Read-only registry of collection schemas.
///
/// Reflected references are resolved by name against this registry, so
/// schemas never hold pointers to each other.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    collections: BTreeMap<String, EntitySchema>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection schema.
    pub fn with_collection(mut self, schema: EntitySchema) -> Self {
        self.add_collection(schema);
        self
    }

    /// Add or replace a collection schema.
    pub fn add_collection(&mut self, schema: EntitySchema) {
        self.collections.insert(schema.name.clone(), schema);
    }

    /// Collection schema by name.
    pub fn collection(&self, name: &str) -> Option<&EntitySchema> {
        self.collections.get(name)
    }

    /// Collection schema by name or a usage error.
    pub fn require_collection(&self, name: &str) -> Result<&EntitySchema, Error> {
        self.collection(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Iterate over collection schemas ordered by name.
    pub fn collections(&self) -> impl Iterator<Item = &EntitySchema> {
        self.collections.values()
    }

    /// Attribute schema or a usage error.
    pub fn attribute(&self, collection: &str, name: &str) -> Result<&AttributeSchema, Error> {
        self.require_collection(collection)?
            .attribute(name)
            .ok_or_else(|| Error::AttributeNotFound {
                attribute: name.to_string(),
                collection: collection.to_string(),
            })
    }

    /// Attribute schema looked up by a name in any naming convention.
    pub fn attribute_by_convention(
        &self,
        collection: &str,
        name: &str,
        convention: NamingConvention,
    ) -> Option<&AttributeSchema> {
        self.collection(collection)?
            .attributes
            .iter()
            .find(|a| convention.apply(a.name()) == name)
    }

    /// Reference schema looked up by a name in any naming convention.
    pub fn reference_by_convention(
        &self,
        collection: &str,
        name: &str,
        convention: NamingConvention,
    ) -> Option<&ReferenceSchema> {
        self.collection(collection)?
            .references
            .iter()
            .find(|r| convention.apply(r.name()) == name)
    }

    /// Resolve a reference, applying reflection.
    pub fn resolve_reference(
        &self,
        collection: &str,
        reference: &str,
    ) -> Result<ResolvedReference, Error> {
        let schema = self.require_collection(collection)?;
        let not_found = || Error::ReferenceNotFound {
            reference: reference.to_string(),
            collection: collection.to_string(),
        };
        match schema.reference(reference).ok_or_else(not_found)? {
            ReferenceSchema::Direct(def) => Ok(ResolvedReference::from_direct(def)),
            ReferenceSchema::Reflected(def) => {
                let origin = self
                    .collection(&def.referenced_collection)
                    .and_then(|target| target.reference(&def.reflected_reference));
                match origin {
                    Some(ReferenceSchema::Direct(origin)) => {
                        Ok(ResolvedReference::from_reflected(def, origin))
                    }
                    _ => Err(Error::Internal(format!(
                        "reflected reference `{}` of `{}` has no declared origin `{}` in `{}`",
                        def.name, collection, def.reflected_reference, def.referenced_collection
                    ))),
                }
            }
        }
    }

    /// Names of attributes unique across the catalog in the scope.
    pub fn globally_unique_attributes(&self, scope: Scope) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .values()
            .flat_map(|c| c.attributes.iter())
            .filter(|a| a.is_globally_unique(scope))
            .map(|a| a.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Validate every schema, collecting all violations.
    pub fn validate(&self) -> Result<(), Error> {
        let mut violations = vec![];
        let mut globals: BTreeMap<&str, &AttributeSchema> = BTreeMap::new();

        for schema in self.collections.values() {
            check_name_collisions(
                &schema.name,
                "attribute",
                schema.attributes.iter().map(|a| a.name()),
                &mut violations,
            );
            check_name_collisions(
                &schema.name,
                "reference",
                schema.references.iter().map(|r| r.name()),
                &mut violations,
            );

            for attribute in &schema.attributes {
                let def = attribute.def();
                if def.value_type.is_array() && !def.sortable_in.is_empty() {
                    violations.push(format!(
                        "attribute `{}` of `{}` is an array and cannot be sortable",
                        def.name, schema.name
                    ));
                }
                for scope in &def.unique_in {
                    if !def.filterable_in.contains(scope) {
                        violations.push(format!(
                            "unique attribute `{}` of `{}` must be filterable in scope {}",
                            def.name, schema.name, scope
                        ));
                    }
                }
                if let AttributeSchema::Global(_) = attribute {
                    match globals.get(def.name.as_str()) {
                        Some(existing) if *existing != attribute => violations.push(format!(
                            "global attribute `{}` is defined differently in `{}`",
                            def.name, schema.name
                        )),
                        Some(_) => {}
                        None => {
                            globals.insert(def.name.as_str(), attribute);
                        }
                    }
                }
            }

            for reference in &schema.references {
                match reference {
                    ReferenceSchema::Direct(def) => {
                        if def.managed && self.collection(&def.referenced_collection).is_none() {
                            violations.push(format!(
                                "reference `{}` of `{}` targets unknown collection `{}`",
                                def.name, schema.name, def.referenced_collection
                            ));
                        }
                    }
                    ReferenceSchema::Reflected(def) => {
                        let origin = self
                            .collection(&def.referenced_collection)
                            .and_then(|c| c.reference(&def.reflected_reference));
                        match origin {
                            Some(ReferenceSchema::Direct(origin))
                                if origin.referenced_collection == schema.name => {}
                            Some(ReferenceSchema::Direct(_)) => violations.push(format!(
                                "reflected reference `{}` of `{}` reflects `{}` which does not target `{}`",
                                def.name, schema.name, def.reflected_reference, schema.name
                            )),
                            Some(ReferenceSchema::Reflected(_)) => violations.push(format!(
                                "reflected reference `{}` of `{}` cannot reflect another reflection",
                                def.name, schema.name
                            )),
                            None => violations.push(format!(
                                "reflected reference `{}` of `{}` reflects unknown reference `{}` of `{}`",
                                def.name, schema.name, def.reflected_reference, def.referenced_collection
                            )),
                        }
                    }
                }
            }

            if !schema.hierarchy && !schema.hierarchy_indexed_in.is_empty() {
                violations.push(format!(
                    "collection `{}` indexes a hierarchy it does not have",
                    schema.name
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::SchemaValidation(violations))
        }
    }
}

/// Report names that become identical under some naming convention.
fn check_name_collisions<'a>(
    collection: &str,
    kind: &str,
    names: impl Iterator<Item = &'a str>,
    violations: &mut Vec<String>,
) {
    let names: Vec<&str> = names.collect();
    for (i, first) in names.iter().enumerate() {
        for second in &names[i + 1..] {
            let clash = NamingConvention::ALL
                .iter()
                .find(|c| c.apply(first) == c.apply(second));
            if let Some(convention) = clash {
                violations.push(format!(
                    "{kind} names `{first}` and `{second}` of `{collection}` collide in {convention:?} case"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        AttributeDef, AttributeType, Cardinality, ReferenceDef, ReferenceIndexType,
        ReflectedReferenceDef,
    };

    fn sample_catalog() -> Catalog {
        Catalog::new()
            .with_collection(
                EntitySchema::new("Product")
                    .with_attribute(AttributeDef::new("code", AttributeType::String).unique())
                    .with_attribute(AttributeDef::new("validFrom", AttributeType::Timestamp))
                    .with_reference(
                        ReferenceDef::new("brand", "Brand", Cardinality::ZeroOrOne)
                            .indexed(ReferenceIndexType::ForFilteringAndPartitioning),
                    ),
            )
            .with_collection(
                EntitySchema::new("Brand").with_reflected_reference(
                    ReflectedReferenceDef::new("products", "Product", "brand"),
                ),
            )
    }

    #[test]
    fn test_valid_catalog() {
        sample_catalog().validate().unwrap();
    }

    #[test]
    fn test_lookup_by_convention() {
        let catalog = sample_catalog();
        let attr = catalog
            .attribute_by_convention("Product", "valid_from", NamingConvention::Snake)
            .unwrap();
        assert_eq!(attr.name(), "validFrom");
        assert!(catalog
            .attribute_by_convention("Product", "VALID_FROM", NamingConvention::UpperSnake)
            .is_some());
    }

    #[test]
    fn test_resolve_reflected_reference() {
        let catalog = sample_catalog();
        let resolved = catalog.resolve_reference("Brand", "products").unwrap();
        assert_eq!(resolved.referenced_collection, "Product");
        assert!(resolved.is_indexed(Scope::Live));
    }

    #[test]
    fn test_missing_reference_is_usage_error() {
        let err = sample_catalog()
            .resolve_reference("Product", "unknown")
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_validate_aggregates_violations() {
        let catalog = sample_catalog().with_collection(
            EntitySchema::new("Tag")
                .with_attribute(AttributeDef::new("label_text", AttributeType::String))
                .with_attribute(AttributeDef::new("labelText", AttributeType::String))
                .with_attribute(AttributeDef::new("codes", AttributeType::StringArray).sortable())
                .with_reflected_reference(ReflectedReferenceDef::new(
                    "products", "Product", "missing",
                )),
        );
        match catalog.validate() {
            Err(Error::SchemaValidation(violations)) => {
                assert_eq!(violations.len(), 3);
                assert!(violations.iter().any(|v| v.contains("collide")));
                assert!(violations.iter().any(|v| v.contains("array")));
                assert!(violations.iter().any(|v| v.contains("unknown reference")));
            }
            other => panic!("expected schema validation error, got {other:?}"),
        }
    }
}
