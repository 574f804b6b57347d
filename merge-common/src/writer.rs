//! Idempotent batch upserts into the customer registry, and the deactivation sweep.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPool;

use crate::classify::ErrorReport;
use crate::error::DatabaseError;
use crate::model::NormalizedCustomer;

/// How the rows of one upsert were applied. Rows whose stored values already matched are in
/// neither count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl std::ops::AddAssign for UpsertCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

#[async_trait]
pub trait CustomerWriter {
    /// Insert or update a batch of customers in a single statement, telling inserts and updates
    /// apart. Every written customer is active afterwards. An empty batch is a no-op.
    async fn upsert_customers(
        &self,
        customers: &[NormalizedCustomer],
    ) -> Result<UpsertCounts, DatabaseError>;

    /// Replace the stored error reports of the given customers.
    async fn upsert_error_reports(&self, reports: &[ErrorReport]) -> Result<(), DatabaseError>;

    /// Deactivate every active customer not in `seen`, returning how many were deactivated.
    /// An empty `seen` set deactivates nothing.
    async fn deactivate_unseen(&self, seen: &HashSet<String>) -> Result<u64, DatabaseError>;
}

/// Keep the last occurrence of every key, in order of first appearance. A single
/// `INSERT ... ON CONFLICT` statement cannot touch the same row twice.
fn last_per_key<'a, T>(items: &'a [T], key: impl Fn(&T) -> &str) -> Vec<&'a T> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(items.len());
    let mut unique: Vec<&T> = Vec::with_capacity(items.len());

    for item in items {
        match positions.get(key(item)) {
            Some(&position) => unique[position] = item,
            None => {
                positions.insert(key(item), unique.len());
                unique.push(item);
            }
        }
    }

    unique
}

/// Column-major view of a customer batch, ready to be bound as arrays and expanded with
/// `UNNEST`.
#[derive(Default)]
struct CustomerColumns {
    customer_numbers: Vec<String>,
    last_names: Vec<String>,
    first_names: Vec<Option<String>>,
    streets: Vec<Option<String>>,
    house_numbers: Vec<Option<String>>,
    suffixes: Vec<Option<String>>,
    postal_codes: Vec<Option<String>>,
    cities: Vec<Option<String>>,
    phones: Vec<Option<String>>,
    mobiles: Vec<Option<String>>,
    birthdays: Vec<Option<NaiveDate>>,
    care_levels: Vec<Option<String>>,
    contract_starts: Vec<Option<NaiveDate>>,
    contract_ends: Vec<Option<NaiveDate>>,
    orders: Vec<Option<String>>,
    sgb_37_3: Vec<bool>,
    care_companies: Vec<bool>,
    service_advisors: Vec<Option<String>>,
    visit_rhythms: Vec<Option<String>>,
    qs_visit_dates: Vec<Option<NaiveDate>>,
    qs_visit_kinds: Vec<Option<String>>,
    qs_visit_histories: Vec<Option<NaiveDate>>,
    qs_visit_notes_1: Vec<Option<String>>,
    qs_visit_notes_2: Vec<Option<String>>,
    planned_months: Vec<Option<NaiveDate>>,
    lons: Vec<Option<f64>>,
    lats: Vec<Option<f64>>,
    reference_ids: Vec<Option<String>>,
    has_errors: Vec<bool>,
    error_reasons: Vec<Option<String>>,
}

impl CustomerColumns {
    fn new(customers: &[&NormalizedCustomer]) -> Self {
        let mut columns = CustomerColumns::default();

        for c in customers {
            columns.customer_numbers.push(c.customer_number.clone());
            columns.last_names.push(c.last_name.clone());
            columns.first_names.push(c.first_name.clone());
            columns.streets.push(c.street.clone());
            columns.house_numbers.push(c.house_number.clone());
            columns.suffixes.push(c.house_number_suffix.clone());
            columns.postal_codes.push(c.postal_code.clone());
            columns.cities.push(c.city.clone());
            columns.phones.push(c.phone.clone());
            columns.mobiles.push(c.mobile.clone());
            columns.birthdays.push(c.birthday);
            columns.care_levels.push(c.care_level.clone());
            columns.contract_starts.push(c.contract_start);
            columns.contract_ends.push(c.contract_end);
            columns.orders.push(c.orders.clone());
            columns.sgb_37_3.push(c.sgb_37_3);
            columns.care_companies.push(c.care_company);
            columns.service_advisors.push(c.service_advisor.clone());
            columns.visit_rhythms.push(c.visit_rhythm.clone());
            columns.qs_visit_dates.push(c.qs_visit_date);
            columns.qs_visit_kinds.push(c.qs_visit_kind.clone());
            columns.qs_visit_histories.push(c.qs_visit_history);
            columns.qs_visit_notes_1.push(c.qs_visit_note_1.clone());
            columns.qs_visit_notes_2.push(c.qs_visit_note_2.clone());
            columns.planned_months.push(c.planned_month);
            columns.lons.push(c.coordinate.map(|coordinate| coordinate.lon));
            columns.lats.push(c.coordinate.map(|coordinate| coordinate.lat));
            columns.reference_ids.push(c.reference_id.clone());
            columns.has_errors.push(c.has_errors);
            columns.error_reasons.push(c.error_reason.clone());
        }

        columns
    }
}

/// Registry writer for the `kunden` and `kunden_fehler` tables.
#[derive(Clone)]
pub struct PgCustomerWriter {
    pool: PgPool,
}

impl PgCustomerWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerWriter for PgCustomerWriter {
    async fn upsert_customers(
        &self,
        customers: &[NormalizedCustomer],
    ) -> Result<UpsertCounts, DatabaseError> {
        if customers.is_empty() {
            return Ok(UpsertCounts::default());
        }
        let unique = last_per_key(customers, |customer| customer.customer_number.as_str());
        let columns = CustomerColumns::new(&unique);

        // `xmax` is 0 only for tuples created by this statement. Rows whose values did not
        // change are filtered by the WHERE clause and not returned at all.
        let base_query = r#"
INSERT INTO kunden AS k
    (
        kundennummer,
        nachname,
        vorname,
        strasse,
        hnr,
        adz,
        plz,
        ort,
        telefon,
        mobil,
        geburtstag,
        kennung,
        start,
        ende,
        auftraege,
        sgb_37_3,
        pflegefirma,
        serviceberater,
        besuchrhythmus,
        qs_besuch_datum,
        qs_besuch_art,
        qs_besuch_historik,
        qs_besuch_hinweis_1,
        qs_besuch_hinweis_2,
        planmonat,
        geom,
        gebref_oid,
        datenfehler,
        begruendung_datenfehler,
        aktiv
    )
SELECT
    u.kundennummer,
    u.nachname,
    u.vorname,
    u.strasse,
    u.hnr,
    u.adz,
    u.plz,
    u.ort,
    u.telefon,
    u.mobil,
    u.geburtstag,
    u.kennung,
    u.start,
    u.ende,
    u.auftraege,
    u.sgb_37_3,
    u.pflegefirma,
    u.serviceberater,
    u.besuchrhythmus,
    u.qs_besuch_datum,
    u.qs_besuch_art,
    u.qs_besuch_historik,
    u.qs_besuch_hinweis_1,
    u.qs_besuch_hinweis_2,
    u.planmonat,
    CASE
        WHEN u.lon IS NULL OR u.lat IS NULL THEN NULL
        ELSE ST_SetSRID(ST_MakePoint(u.lon, u.lat), 4326)
    END,
    u.gebref_oid,
    u.datenfehler,
    u.begruendung_datenfehler,
    TRUE
FROM UNNEST(
        $1::text[],
        $2::text[],
        $3::text[],
        $4::text[],
        $5::text[],
        $6::text[],
        $7::text[],
        $8::text[],
        $9::text[],
        $10::text[],
        $11::date[],
        $12::text[],
        $13::date[],
        $14::date[],
        $15::text[],
        $16::boolean[],
        $17::boolean[],
        $18::text[],
        $19::text[],
        $20::date[],
        $21::text[],
        $22::date[],
        $23::text[],
        $24::text[],
        $25::date[],
        $26::float8[],
        $27::float8[],
        $28::text[],
        $29::boolean[],
        $30::text[]
    ) AS u(
        kundennummer,
        nachname,
        vorname,
        strasse,
        hnr,
        adz,
        plz,
        ort,
        telefon,
        mobil,
        geburtstag,
        kennung,
        start,
        ende,
        auftraege,
        sgb_37_3,
        pflegefirma,
        serviceberater,
        besuchrhythmus,
        qs_besuch_datum,
        qs_besuch_art,
        qs_besuch_historik,
        qs_besuch_hinweis_1,
        qs_besuch_hinweis_2,
        planmonat,
        lon,
        lat,
        gebref_oid,
        datenfehler,
        begruendung_datenfehler
    )
ON CONFLICT (kundennummer) DO UPDATE SET
    nachname = EXCLUDED.nachname,
    vorname = EXCLUDED.vorname,
    strasse = EXCLUDED.strasse,
    hnr = EXCLUDED.hnr,
    adz = EXCLUDED.adz,
    plz = EXCLUDED.plz,
    ort = EXCLUDED.ort,
    telefon = EXCLUDED.telefon,
    mobil = EXCLUDED.mobil,
    geburtstag = EXCLUDED.geburtstag,
    kennung = EXCLUDED.kennung,
    start = EXCLUDED.start,
    ende = EXCLUDED.ende,
    auftraege = EXCLUDED.auftraege,
    sgb_37_3 = EXCLUDED.sgb_37_3,
    pflegefirma = EXCLUDED.pflegefirma,
    serviceberater = EXCLUDED.serviceberater,
    besuchrhythmus = EXCLUDED.besuchrhythmus,
    qs_besuch_datum = EXCLUDED.qs_besuch_datum,
    qs_besuch_art = EXCLUDED.qs_besuch_art,
    qs_besuch_historik = EXCLUDED.qs_besuch_historik,
    qs_besuch_hinweis_1 = EXCLUDED.qs_besuch_hinweis_1,
    qs_besuch_hinweis_2 = EXCLUDED.qs_besuch_hinweis_2,
    planmonat = EXCLUDED.planmonat,
    geom = EXCLUDED.geom,
    gebref_oid = EXCLUDED.gebref_oid,
    datenfehler = EXCLUDED.datenfehler,
    begruendung_datenfehler = EXCLUDED.begruendung_datenfehler,
    aktiv = TRUE
WHERE
    (
        k.nachname, k.vorname, k.strasse, k.hnr, k.adz, k.plz, k.ort, k.telefon, k.mobil,
        k.geburtstag, k.kennung, k.start, k.ende, k.auftraege, k.sgb_37_3, k.pflegefirma,
        k.serviceberater, k.besuchrhythmus, k.qs_besuch_datum, k.qs_besuch_art,
        k.qs_besuch_historik, k.qs_besuch_hinweis_1, k.qs_besuch_hinweis_2, k.planmonat,
        k.geom, k.gebref_oid, k.datenfehler, k.begruendung_datenfehler, k.aktiv
    ) IS DISTINCT FROM (
        EXCLUDED.nachname, EXCLUDED.vorname, EXCLUDED.strasse, EXCLUDED.hnr, EXCLUDED.adz,
        EXCLUDED.plz, EXCLUDED.ort, EXCLUDED.telefon, EXCLUDED.mobil, EXCLUDED.geburtstag,
        EXCLUDED.kennung, EXCLUDED.start, EXCLUDED.ende, EXCLUDED.auftraege,
        EXCLUDED.sgb_37_3, EXCLUDED.pflegefirma, EXCLUDED.serviceberater,
        EXCLUDED.besuchrhythmus, EXCLUDED.qs_besuch_datum, EXCLUDED.qs_besuch_art,
        EXCLUDED.qs_besuch_historik, EXCLUDED.qs_besuch_hinweis_1,
        EXCLUDED.qs_besuch_hinweis_2, EXCLUDED.planmonat, EXCLUDED.geom,
        EXCLUDED.gebref_oid, EXCLUDED.datenfehler, EXCLUDED.begruendung_datenfehler,
        EXCLUDED.aktiv
    )
RETURNING (xmax = 0) AS inserted
        "#;

        let inserted: Vec<bool> = sqlx::query_scalar(base_query)
            .bind(&columns.customer_numbers)
            .bind(&columns.last_names)
            .bind(&columns.first_names)
            .bind(&columns.streets)
            .bind(&columns.house_numbers)
            .bind(&columns.suffixes)
            .bind(&columns.postal_codes)
            .bind(&columns.cities)
            .bind(&columns.phones)
            .bind(&columns.mobiles)
            .bind(&columns.birthdays)
            .bind(&columns.care_levels)
            .bind(&columns.contract_starts)
            .bind(&columns.contract_ends)
            .bind(&columns.orders)
            .bind(&columns.sgb_37_3)
            .bind(&columns.care_companies)
            .bind(&columns.service_advisors)
            .bind(&columns.visit_rhythms)
            .bind(&columns.qs_visit_dates)
            .bind(&columns.qs_visit_kinds)
            .bind(&columns.qs_visit_histories)
            .bind(&columns.qs_visit_notes_1)
            .bind(&columns.qs_visit_notes_2)
            .bind(&columns.planned_months)
            .bind(&columns.lons)
            .bind(&columns.lats)
            .bind(&columns.reference_ids)
            .bind(&columns.has_errors)
            .bind(&columns.error_reasons)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("INSERT", error))?;

        let inserted_count = inserted.iter().filter(|inserted| **inserted).count();
        Ok(UpsertCounts {
            inserted: inserted_count as u64,
            updated: (inserted.len() - inserted_count) as u64,
        })
    }

    async fn upsert_error_reports(&self, reports: &[ErrorReport]) -> Result<(), DatabaseError> {
        if reports.is_empty() {
            return Ok(());
        }
        let unique = last_per_key(reports, |report| report.customer_number.as_str());

        let mut customer_numbers = Vec::with_capacity(unique.len());
        let mut has_errors = Vec::with_capacity(unique.len());
        let mut classes = Vec::with_capacity(unique.len());
        let mut error_counts = Vec::with_capacity(unique.len());
        let mut missing_rhythm = Vec::with_capacity(unique.len());
        let mut missing_care_level = Vec::with_capacity(unique.len());
        let mut inconsistent = Vec::with_capacity(unique.len());
        let mut missing_history = Vec::with_capacity(unique.len());
        let mut missing_contact = Vec::with_capacity(unique.len());
        let mut missing_birthday = Vec::with_capacity(unique.len());
        let mut no_geocode = Vec::with_capacity(unique.len());
        let mut address_changed = Vec::with_capacity(unique.len());
        let mut addresses_new = Vec::with_capacity(unique.len());

        for report in unique {
            customer_numbers.push(report.customer_number.clone());
            has_errors.push(report.has_errors());
            classes.push(report.address_class.as_str());
            error_counts.push(report.error_count);
            missing_rhythm.push(report.flags.missing_rhythm);
            missing_care_level.push(report.flags.missing_care_level);
            inconsistent.push(report.flags.inconsistent_care_rhythm);
            missing_history.push(report.flags.missing_history_date);
            missing_contact.push(report.flags.missing_contact);
            missing_birthday.push(report.flags.missing_birthday);
            no_geocode.push(report.flags.no_geocode);
            address_changed.push(report.flags.address_changed);
            addresses_new.push(report.address_new.clone());
        }

        let base_query = r#"
INSERT INTO kunden_fehler
    (
        kundennummer,
        datenfehler,
        klasse,
        fehleranzahl,
        rhythmus_fehler,
        kennung_fehler,
        inkonsistenz,
        historik_fehler,
        kontakt_fehler,
        geburtstag_fehler,
        geom_fehler,
        adresse_geaendert,
        adresse_neu
    )
SELECT *
FROM UNNEST(
        $1::text[],
        $2::boolean[],
        $3::text[],
        $4::integer[],
        $5::boolean[],
        $6::boolean[],
        $7::boolean[],
        $8::boolean[],
        $9::boolean[],
        $10::boolean[],
        $11::boolean[],
        $12::boolean[],
        $13::text[]
    )
ON CONFLICT (kundennummer) DO UPDATE SET
    datenfehler = EXCLUDED.datenfehler,
    klasse = EXCLUDED.klasse,
    fehleranzahl = EXCLUDED.fehleranzahl,
    rhythmus_fehler = EXCLUDED.rhythmus_fehler,
    kennung_fehler = EXCLUDED.kennung_fehler,
    inkonsistenz = EXCLUDED.inkonsistenz,
    historik_fehler = EXCLUDED.historik_fehler,
    kontakt_fehler = EXCLUDED.kontakt_fehler,
    geburtstag_fehler = EXCLUDED.geburtstag_fehler,
    geom_fehler = EXCLUDED.geom_fehler,
    adresse_geaendert = EXCLUDED.adresse_geaendert,
    adresse_neu = EXCLUDED.adresse_neu
        "#;

        sqlx::query(base_query)
            .bind(&customer_numbers)
            .bind(&has_errors)
            .bind(&classes)
            .bind(&error_counts)
            .bind(&missing_rhythm)
            .bind(&missing_care_level)
            .bind(&inconsistent)
            .bind(&missing_history)
            .bind(&missing_contact)
            .bind(&missing_birthday)
            .bind(&no_geocode)
            .bind(&address_changed)
            .bind(&addresses_new)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("INSERT", error))?;

        Ok(())
    }

    async fn deactivate_unseen(&self, seen: &HashSet<String>) -> Result<u64, DatabaseError> {
        if seen.is_empty() {
            return Ok(0);
        }
        let seen: Vec<&str> = seen.iter().map(String::as_str).collect();

        let base_query = r#"
UPDATE
    kunden
SET
    aktiv = FALSE
WHERE
    (kundennummer IS NULL OR NOT (kundennummer = ANY($1::text[])))
    AND aktiv IS DISTINCT FROM FALSE
        "#;

        let result = sqlx::query(base_query)
            .bind(&seen)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(result.rows_affected())
    }
}
