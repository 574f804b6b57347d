use chrono::{DateTime, NaiveDate, Utc};

/// One raw line of an uploaded export, exactly as the staging producer stored it.
/// Every payload column is free text; nothing here has been validated.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct StagingRow {
    pub id: i64,
    pub import_id: i64,
    pub imported_at: DateTime<Utc>,
    /// "Surname, Givenname".
    pub customer: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub birthday: Option<String>,
    /// Care-level code ("Kennung").
    pub care_level: Option<String>,
    pub contract_start: Option<String>,
    pub contract_end: Option<String>,
    pub orders: Option<String>,
    pub service_advisor: Option<String>,
    pub visit_rhythm: Option<String>,
    pub qs_visit_date: Option<String>,
    pub qs_visit_kind: Option<String>,
    pub qs_visit_history: Option<String>,
    pub qs_visit_note_1: Option<String>,
    pub qs_visit_note_2: Option<String>,
}

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

/// An exact hit in the normalized building reference.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingReferenceMatch {
    pub reference_id: String,
    pub street: String,
    pub house_number: Option<String>,
    pub city: Option<String>,
    pub coordinate: Coordinate,
}

/// The working record threaded through normalization, resolution and classification,
/// and finally written to the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedCustomer {
    pub customer_number: String,
    pub last_name: String,
    pub first_name: Option<String>,
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub house_number_suffix: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub birthday: Option<NaiveDate>,
    /// Canonical "Pflegegrad N", suffixed with `*` when inferred from the rhythm.
    pub care_level: Option<String>,
    pub contract_start: Option<NaiveDate>,
    pub contract_end: Option<NaiveDate>,
    pub orders: Option<String>,
    pub sgb_37_3: bool,
    pub care_company: bool,
    pub service_advisor: Option<String>,
    /// Canonical "N Monate", suffixed with `*` when inferred from the care level.
    pub visit_rhythm: Option<String>,
    pub qs_visit_date: Option<NaiveDate>,
    pub qs_visit_kind: Option<String>,
    pub qs_visit_history: Option<NaiveDate>,
    pub qs_visit_note_1: Option<String>,
    pub qs_visit_note_2: Option<String>,
    /// First day of the month the next review is due ("Planmonat").
    pub planned_month: Option<NaiveDate>,
    pub coordinate: Option<Coordinate>,
    pub reference_id: Option<String>,
    pub has_errors: bool,
    pub error_reason: Option<String>,
}

impl NormalizedCustomer {
    /// "street house-number suffix" as it would be printed on an envelope.
    pub fn full_street(&self) -> String {
        let mut full = self.street.clone().unwrap_or_default();
        if let Some(house_number) = &self.house_number {
            full.push(' ');
            full.push_str(house_number);
        }
        if let Some(suffix) = &self.house_number_suffix {
            full.push_str(suffix);
        }
        full
    }

    /// Take over the official spelling from a reference hit.
    pub fn apply_reference(&mut self, reference: &BuildingReferenceMatch) {
        self.street = Some(reference.street.clone());
        self.house_number = reference.house_number.clone();
        self.reference_id = Some(reference.reference_id.clone());
        self.coordinate = Some(reference.coordinate);
    }
}
