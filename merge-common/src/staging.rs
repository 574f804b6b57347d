//! Reading staged rows and selecting one row per logical customer.
use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::error::DatabaseError;
use crate::model::StagingRow;
use crate::normalize::{normalize_city, normalize_name, normalize_postal_code, normalize_street};

#[async_trait]
pub trait StagingSource {
    /// All staged rows of one import, in no particular order.
    async fn load(&self, import_id: i64) -> Result<Vec<StagingRow>, DatabaseError>;
}

/// Reads `kunden_import`, the append-only table written by the staging producer.
#[derive(Clone)]
pub struct PgStagingSource {
    pool: PgPool,
}

impl PgStagingSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StagingSource for PgStagingSource {
    async fn load(&self, import_id: i64) -> Result<Vec<StagingRow>, DatabaseError> {
        let base_query = r#"
SELECT
    id,
    import_id,
    imported_at,
    kunde AS customer,
    strasse AS street,
    plz AS postal_code,
    ort AS city,
    telefon AS phone,
    mobil AS mobile,
    geburtstag AS birthday,
    kennung AS care_level,
    start AS contract_start,
    ende AS contract_end,
    auftraege AS orders,
    serviceberater AS service_advisor,
    besuchrhythmus AS visit_rhythm,
    qs_besuch_datum AS qs_visit_date,
    qs_besuch_art AS qs_visit_kind,
    qs_besuch_historik AS qs_visit_history,
    qs_besuch_hinweis_1 AS qs_visit_note_1,
    qs_besuch_hinweis_2 AS qs_visit_note_2
FROM
    kunden_import
WHERE
    import_id = $1
        "#;

        sqlx::query_as(base_query)
            .bind(import_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))
    }
}

/// Identity of a staged row for deduplication: the normalized name, street, house number,
/// postal code and city. Names are compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DedupKey {
    pub last_name: String,
    pub first_name: Option<String>,
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub suffix: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
}

impl DedupKey {
    pub fn of(row: &StagingRow) -> Self {
        let name = row.customer.as_deref().and_then(|customer| normalize_name(customer).ok());
        let street = normalize_street(row.street.as_deref().unwrap_or_default());

        let (last_name, first_name) = match name {
            Some(name) => (
                name.last_name.to_lowercase(),
                name.first_name.map(|first_name| first_name.to_lowercase()),
            ),
            None => (String::new(), None),
        };

        DedupKey {
            last_name,
            first_name,
            street: street.street.map(|street| street.to_lowercase()),
            house_number: street.house_number,
            suffix: street.suffix.map(|suffix| suffix.to_lowercase()),
            postal_code: normalize_postal_code(row.postal_code.as_deref()),
            city: normalize_city(row.city.as_deref()).map(|city| city.to_lowercase()),
        }
    }

    /// Rows with neither a name nor a street carry nothing worth merging.
    fn is_blank(&self) -> bool {
        self.last_name.is_empty() && self.street.is_none() && self.house_number.is_none()
    }
}

/// Keep the latest staged row per [`DedupKey`], dropping blank rows. Ties on `imported_at` go
/// to the row staged last (highest id). The result is ordered latest first.
pub fn dedup_rows(rows: Vec<StagingRow>) -> Vec<StagingRow> {
    let mut latest: BTreeMap<DedupKey, StagingRow> = BTreeMap::new();

    for row in rows {
        let key = DedupKey::of(&row);
        if key.is_blank() {
            continue;
        }

        match latest.get(&key) {
            Some(kept) if (kept.imported_at, kept.id) >= (row.imported_at, row.id) => (),
            _ => {
                latest.insert(key, row);
            }
        }
    }

    let mut rows: Vec<StagingRow> = latest.into_values().collect();
    rows.sort_by(|a, b| (b.imported_at, b.id).cmp(&(a.imported_at, a.id)));
    rows
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;

    fn row(id: i64, customer: &str, street: &str, imported_at: DateTime<Utc>) -> StagingRow {
        StagingRow {
            id,
            import_id: 1,
            imported_at,
            customer: Some(customer.to_owned()),
            street: Some(street.to_owned()),
            postal_code: Some("47051".to_owned()),
            city: Some("Duisburg".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_row_wins() {
        let now = Utc::now();
        let rows = vec![
            StagingRow {
                phone: Some("0203 1".to_owned()),
                ..row(2, "Mustermann, Max", "Musterstr. 12", now)
            },
            StagingRow {
                phone: Some("0203 2".to_owned()),
                ..row(1, "MUSTERMANN,  Max", "musterstr.  12", now - Duration::hours(1))
            },
        ];

        let deduped = dedup_rows(rows);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].id, 2);
        assert_eq!(deduped[0].phone.as_deref(), Some("0203 1"));
    }

    #[test]
    fn test_latest_row_wins_across_street_spellings() {
        let now = Utc::now();
        let rows = vec![
            StagingRow {
                phone: Some("0203 999999".to_owned()),
                ..row(1, "Mustermann, Max", "Musterstr. 12", now)
            },
            StagingRow {
                phone: Some("0203 111111".to_owned()),
                ..row(2, "Mustermann, Max", "Musterstraße 12", now - Duration::hours(1))
            },
            StagingRow {
                postal_code: Some("47 051".to_owned()),
                city: Some(" duisburg".to_owned()),
                ..row(3, "mustermann,max", "MUSTERSTRASSE 12", now - Duration::hours(2))
            },
        ];

        let deduped = dedup_rows(rows);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].id, 1);
        assert_eq!(deduped[0].phone.as_deref(), Some("0203 999999"));
    }

    #[test]
    fn test_rows_are_ordered_latest_first() {
        let now = Utc::now();
        let rows = vec![
            row(1, "Mustermann, Max", "Musterstr. 12", now - Duration::hours(2)),
            row(2, "Musterfrau, Erika", "Hauptstr. 3", now),
            row(3, "Beispiel, Bert", "Am Markt 1", now - Duration::hours(1)),
        ];

        let ids: Vec<i64> = dedup_rows(rows).iter().map(|row| row.id).collect();

        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_equal_timestamps_prefer_higher_id() {
        let now = Utc::now();
        let rows = vec![
            row(7, "Mustermann, Max", "Musterstr. 12", now),
            row(3, "Mustermann, Max", "Musterstr. 12", now),
        ];

        assert_eq!(dedup_rows(rows)[0].id, 7);
    }

    #[test]
    fn test_blank_rows_are_dropped() {
        let now = Utc::now();
        let blank = StagingRow {
            customer: Some("  ".to_owned()),
            street: None,
            ..row(1, "", "", now)
        };
        let street_only = StagingRow {
            customer: None,
            ..row(2, "", "Musterstr. 12", now)
        };

        let deduped = dedup_rows(vec![blank, street_only]);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].id, 2);
    }

    #[test]
    fn test_people_sharing_surname_and_address_are_kept() {
        let now = Utc::now();
        let rows = vec![
            row(1, "Mustermann, Max", "Musterstr. 12", now),
            row(2, "Mustermann, Erika", "Musterstraße 12", now),
            row(3, "Musterfrau, Erika", "Musterstr. 12", now),
        ];

        assert_eq!(dedup_rows(rows).len(), 3);
    }

    async fn stage(db: &PgPool, import_id: i64, customer: &str, street: &str) {
        sqlx::query(
            r#"
INSERT INTO kunden_import (import_id, imported_at, imported_by, kunde, strasse, plz, ort)
VALUES ($1, NOW(), 'test', $2, $3, '47051', 'Duisburg')
            "#,
        )
        .bind(import_id)
        .bind(customer)
        .bind(street)
        .execute(db)
        .await
        .expect("failed to stage row");
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires PostgreSQL with PostGIS"]
    async fn test_load_reads_one_import(db: PgPool) {
        stage(&db, 1, "Mustermann, Max", "Musterstr. 12").await;
        stage(&db, 1, "Musterfrau, Erika", "Hauptstraße 3").await;
        stage(&db, 2, "Beispiel, Bert", "Am Markt 1").await;

        let source = PgStagingSource::new(db);
        let rows = source.load(1).await.expect("failed to load staging rows");

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.import_id == 1));
        assert!(rows
            .iter()
            .any(|row| row.customer.as_deref() == Some("Mustermann, Max")));
    }
}
