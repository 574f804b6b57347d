//! Address-to-coordinate resolution: an exact building-reference match first, the external
//! geocoder second. Resolution never fails; a miss is a result like any other.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::{BuildingReferenceMatch, Coordinate, NormalizedCustomer};

pub mod geocoder;
pub mod reference;

pub use geocoder::{geocode_with_fallback, Geocode, GeocodeError, GeocodeRequest, OgcGeocoder};
pub use reference::{PgReferenceLookup, ReferenceKey, ReferenceLookup};

/// The address parts of a customer that take part in resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressQuery {
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub suffix: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
}

impl AddressQuery {
    pub fn from_customer(customer: &NormalizedCustomer) -> Self {
        AddressQuery {
            street: customer.street.clone(),
            house_number: customer.house_number.clone(),
            suffix: customer.house_number_suffix.clone(),
            postal_code: customer.postal_code.clone(),
            city: customer.city.clone(),
        }
    }

    /// House number with its suffix attached, e.g. "12a".
    fn combined_house_number(&self) -> Option<String> {
        let number = self.house_number.as_deref()?;
        Some(format!("{}{}", number, self.suffix.as_deref().unwrap_or_default()))
    }

    /// The external lookup is only worth a request when the address is complete.
    fn is_complete(&self) -> bool {
        [&self.street, &self.house_number, &self.postal_code, &self.city]
            .iter()
            .all(|part| part.as_deref().is_some_and(|value| !value.trim().is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Reference(BuildingReferenceMatch),
    Geocoded(Coordinate),
    Unresolved,
}

impl Resolution {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            Resolution::Reference(reference) => Some(reference.coordinate),
            Resolution::Geocoded(coordinate) => Some(*coordinate),
            Resolution::Unresolved => None,
        }
    }

    /// Write the outcome into the customer. A reference hit also replaces street and house
    /// number with the official spelling.
    pub fn apply_to(&self, customer: &mut NormalizedCustomer) {
        match self {
            Resolution::Reference(reference) => customer.apply_reference(reference),
            Resolution::Geocoded(coordinate) => customer.coordinate = Some(*coordinate),
            Resolution::Unresolved => (),
        }
    }
}

#[derive(Clone)]
pub struct AddressResolver {
    reference: Arc<dyn ReferenceLookup + Send + Sync>,
    /// `None` disables the external fallback.
    geocoder: Option<Arc<dyn Geocode + Send + Sync>>,
}

impl AddressResolver {
    pub fn new(
        reference: Arc<dyn ReferenceLookup + Send + Sync>,
        geocoder: Option<Arc<dyn Geocode + Send + Sync>>,
    ) -> Self {
        Self {
            reference,
            geocoder,
        }
    }

    pub async fn resolve(&self, query: &AddressQuery) -> Resolution {
        if let Some(reference) = self.match_reference(query).await {
            return Resolution::Reference(reference);
        }

        match self.geocode(query).await {
            Some(coordinate) => Resolution::Geocoded(coordinate),
            None => Resolution::Unresolved,
        }
    }

    async fn match_reference(&self, query: &AddressQuery) -> Option<BuildingReferenceMatch> {
        let key = ReferenceKey::new(
            query.city.as_deref(),
            query.street.as_deref(),
            query.house_number.as_deref(),
            query.suffix.as_deref(),
        )?;

        match self.reference.find(&key).await {
            Ok(Some(found)) => {
                metrics::counter!("merge_reference_match_total", "outcome" => "hit").increment(1);
                Some(found)
            }
            Ok(None) => {
                metrics::counter!("merge_reference_match_total", "outcome" => "miss").increment(1);
                None
            }
            Err(error) => {
                warn!(?key, "building reference lookup failed: {}", error);
                metrics::counter!("merge_reference_match_total", "outcome" => "error").increment(1);
                None
            }
        }
    }

    async fn geocode(&self, query: &AddressQuery) -> Option<Coordinate> {
        let geocoder = self.geocoder.as_deref()?;
        if !query.is_complete() {
            metrics::counter!("merge_geocode_total", "outcome" => "skipped").increment(1);
            return None;
        }
        let street = query.street.as_deref()?;
        let house_number = query.combined_house_number()?;

        match geocode_with_fallback(geocoder, street, &house_number).await {
            Ok(coordinate) => {
                metrics::counter!("merge_geocode_total", "outcome" => "hit").increment(1);
                Some(coordinate)
            }
            Err(GeocodeError::NoResults) => {
                debug!(street = %street, house_number = %house_number, "geocoder found no match");
                metrics::counter!("merge_geocode_total", "outcome" => "miss").increment(1);
                None
            }
            Err(error) => {
                warn!(street = %street, house_number = %house_number, "geocoder failed: {}", error);
                metrics::counter!("merge_geocode_total", "outcome" => "error").increment(1);
                None
            }
        }
    }
}
