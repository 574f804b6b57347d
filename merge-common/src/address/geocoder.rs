//! Fallback geocoding through the state's OGC API Features endpoint for building addresses.
use std::time;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::model::Coordinate;

pub const DEFAULT_GEOCODER_URL: &str = "https://ogc-api.nrw.de/gebref/v1/collections/gebref/items";
/// Service area: the Ruhr cities the provider operates in.
const SERVICE_AREA_BBOX: &str = "6.470947,51.288547,7.051849,51.599254";
const CRS84: &str = "http://www.opengis.net/def/crs/OGC/1.3/CRS84";

static NUMBER_WITH_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\s*[-/]\s*\d+)*)(?:\s*([A-Za-z]{1,3}))?$").expect("valid regex")
});
static NUMBER_THEN_ANYTHING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(.*)$").expect("valid regex"));
static UNICODE_DASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[–—−]").expect("valid regex"));

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("geocoder responded with status {0}")]
    StatusError(u16),
    #[error("geocoder response had no coordinates")]
    NoResults,
}

/// One lookup: street, house number and optionally the suffix as a separate parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeRequest {
    pub street: String,
    pub house_number: String,
    pub suffix: Option<String>,
}

#[async_trait]
pub trait Geocode {
    async fn geocode(&self, request: &GeocodeRequest) -> Result<Coordinate, GeocodeError>;
}

/// Split a house number into its numeric part (ranges allowed) and a trailing letter suffix.
pub fn split_house_number(raw: &str) -> (String, Option<String>) {
    let normalized = UNICODE_DASHES.replace_all(raw.trim(), "-");

    if let Some(captures) = NUMBER_WITH_SUFFIX.captures(&normalized) {
        let number: String = captures[1].chars().filter(|c| !c.is_whitespace()).collect();
        let suffix = captures.get(2).map(|m| m.as_str().to_owned());
        return (number, suffix);
    }
    if let Some(captures) = NUMBER_THEN_ANYTHING.captures(&normalized) {
        let rest = captures[2].trim();
        let suffix = if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        };
        return (captures[1].to_owned(), suffix);
    }

    (normalized.into_owned(), None)
}

/// Look up "street number+suffix" first; when that finds nothing and the house number has a
/// separable suffix, retry with the suffix as its own parameter.
pub async fn geocode_with_fallback(
    geocoder: &(dyn Geocode + Send + Sync),
    street: &str,
    house_number: &str,
) -> Result<Coordinate, GeocodeError> {
    let combined = GeocodeRequest {
        street: street.to_owned(),
        house_number: house_number.to_owned(),
        suffix: None,
    };
    match geocoder.geocode(&combined).await {
        Err(GeocodeError::NoResults) => (),
        other => return other,
    }

    let (number, suffix) = split_house_number(house_number);
    let Some(suffix) = suffix else {
        return Err(GeocodeError::NoResults);
    };

    geocoder
        .geocode(&GeocodeRequest {
            street: street.to_owned(),
            house_number: number,
            suffix: Some(suffix),
        })
        .await
}

#[derive(Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
}

#[derive(Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Vec<f64>,
}

impl FeatureCollection {
    fn first_coordinate(&self) -> Option<Coordinate> {
        let geometry = self.features.first()?.geometry.as_ref()?;
        match geometry.coordinates.as_slice() {
            [lon, lat, ..] => Some(Coordinate {
                lon: *lon,
                lat: *lat,
            }),
            _ => None,
        }
    }
}

/// Geocoder backed by an OGC API Features collection.
pub struct OgcGeocoder {
    url: String,
    client: reqwest::Client,
}

impl OgcGeocoder {
    pub fn new(url: &str, timeout: time::Duration) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent("Customer Merge Worker")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            url: url.to_owned(),
            client,
        })
    }
}

#[async_trait]
impl Geocode for OgcGeocoder {
    async fn geocode(&self, request: &GeocodeRequest) -> Result<Coordinate, GeocodeError> {
        let mut query = vec![
            ("str", request.street.as_str()),
            ("hnr", request.house_number.as_str()),
            ("bbox", SERVICE_AREA_BBOX),
            ("bbox-crs", CRS84),
            ("crs", CRS84),
            ("f", "json"),
        ];
        if let Some(suffix) = &request.suffix {
            query.push(("adz", suffix.as_str()));
        }

        let response = self.client.get(&self.url).query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::StatusError(status.as_u16()));
        }

        let collection: FeatureCollection = response.json().await?;
        collection.first_coordinate().ok_or(GeocodeError::NoResults)
    }
}
