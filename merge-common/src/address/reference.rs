//! Exact lookups against the normalized building reference ("T0" match).
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::PgPool;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::DatabaseError;
use crate::model::{BuildingReferenceMatch, Coordinate};

static STRASSE_ENDING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*)strasse$").expect("valid regex"));
static DETACHED_ENDING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*[^ ])(str|weg)$").expect("valid regex"));
static LEADING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d+)").expect("valid regex"));

/// Lowercase, strip accents, spell out ß and reduce everything that is not `[a-z0-9]` to
/// single spaces.
pub fn fold_name(raw: &str) -> String {
    let folded: String = raw
        .replace('ß', "ss")
        .replace('ẞ', "ss")
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Street names share one spelling for the common endings: "strasse" becomes "str", and
/// "str"/"weg" glued to the name are split off. "Musterstraße", "Muster Str." and
/// "musterstrasse" all end up as "muster str".
pub fn fold_street(raw: &str) -> String {
    let folded = fold_name(raw);
    let folded = STRASSE_ENDING.replace(&folded, "${1}str");
    DETACHED_ENDING.replace(&folded, "$1 $2").into_owned()
}

/// Lookup key into the building reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    pub district: String,
    pub street: String,
    pub number: i32,
    /// Lowercased suffix, empty when the house number has none.
    pub suffix: String,
}

impl ReferenceKey {
    /// Build a key from the customer's address parts. `None` when one of city, street or a
    /// numeric house number is missing.
    pub fn new(
        city: Option<&str>,
        street: Option<&str>,
        house_number: Option<&str>,
        suffix: Option<&str>,
    ) -> Option<Self> {
        let district = fold_name(city?);
        let street = fold_street(street?);
        let number = LEADING_DIGITS
            .captures(house_number?)?
            .get(1)?
            .as_str()
            .parse()
            .ok()?;
        if district.is_empty() || street.is_empty() {
            return None;
        }

        Some(ReferenceKey {
            district,
            street,
            number,
            suffix: suffix.map(|s| s.trim().to_lowercase()).unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait ReferenceLookup {
    /// Most recently dated reference entry for the key, if any.
    async fn find(&self, key: &ReferenceKey) -> Result<Option<BuildingReferenceMatch>, DatabaseError>;
}

#[derive(sqlx::FromRow)]
struct ReferenceRow {
    oid: String,
    street_src: String,
    hnr_src: Option<String>,
    ort_src: Option<String>,
    lon: f64,
    lat: f64,
}

impl From<ReferenceRow> for BuildingReferenceMatch {
    fn from(row: ReferenceRow) -> Self {
        BuildingReferenceMatch {
            reference_id: row.oid,
            street: row.street_src,
            house_number: row.hnr_src,
            city: row.ort_src,
            coordinate: Coordinate {
                lon: row.lon,
                lat: row.lat,
            },
        }
    }
}

/// Reads the `gebref_norm` view.
#[derive(Clone)]
pub struct PgReferenceLookup {
    pool: PgPool,
}

impl PgReferenceLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferenceLookup for PgReferenceLookup {
    async fn find(&self, key: &ReferenceKey) -> Result<Option<BuildingReferenceMatch>, DatabaseError> {
        let base_query = r#"
SELECT
    oid,
    street_src,
    hnr_src,
    ort_src,
    ST_X(geom_4326) AS lon,
    ST_Y(geom_4326) AS lat
FROM
    gebref_norm
WHERE
    kreis_norm = $1
    AND street_norm = $2
    AND hnr_num = $3
    AND COALESCE(hnr_suffix, '') = $4
ORDER BY
    stichtag DESC NULLS LAST
LIMIT 1
        "#;

        let row: Option<ReferenceRow> = sqlx::query_as(base_query)
            .bind(&key.district)
            .bind(&key.street)
            .bind(key.number)
            .bind(&key.suffix)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))?;

        Ok(row.map(BuildingReferenceMatch::from))
    }
}
