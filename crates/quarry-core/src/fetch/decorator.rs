//! Assembly of a sealed entity from its stored parts.

use quarry_proto::{EntityFetch, SealedEntity};

use super::FetchSession;
use crate::error::Error;
use crate::storage::EntityBodyPart;

/// Entity with the attributes, associated data and prices the fetch asks
/// for. References and parents are attached by the caller.
pub(super) fn decorate(
    session: &FetchSession<'_, '_, '_>,
    body: &EntityBodyPart,
    fetch: &EntityFetch,
) -> Result<SealedEntity, Error> {
    let collection = body.collection.as_str();
    let pk = body.primary_key;
    let mut entity = SealedEntity::new(collection, pk, body.scope);
    entity.locale = fetch
        .locale
        .clone()
        .filter(|locale| body.locales.contains(locale));

    // prefetched parts were loaded for the locale of the root fetch
    let root_locale = session
        .ctx()
        .query()
        .require
        .entity_fetch
        .as_ref()
        .and_then(|f| f.locale.as_ref());
    let prefetched = session
        .prefetched(collection, pk)
        .filter(|_| fetch.locale.as_ref() == root_locale);

    if fetch.attributes.is_requested() {
        let attributes = match prefetched.and_then(|p| p.attributes.clone()) {
            Some(attributes) => Some(attributes),
            None => session
                .storage()
                .get_attributes(collection, pk, fetch.locale.as_deref())?,
        };
        if let Some(attributes) = attributes {
            entity.attributes = attributes
                .values
                .into_iter()
                .filter(|(name, _)| fetch.attributes.includes(name))
                .collect();
        }
    }

    for name in &fetch.associated_data {
        let value = match prefetched.and_then(|p| p.associated_data.get(name)) {
            Some(value) => value.clone(),
            None => session
                .storage()
                .get_associated_data(collection, pk, name)?
                .map(|part| part.value),
        };
        if let Some(value) = value {
            entity.associated_data.insert(name.clone(), value);
        }
    }

    if fetch.prices {
        let prices = match prefetched.and_then(|p| p.prices.clone()) {
            Some(prices) => Some(prices),
            None => session.storage().get_prices(collection, pk)?,
        };
        entity.prices = prices.map(|part| part.prices).unwrap_or_default();
    }

    Ok(entity)
}
