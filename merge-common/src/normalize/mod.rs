//! Pure transformations from raw staging text into canonical customer fields.
//!
//! Nothing in here touches the network or the database; every function is deterministic so the
//! same export row always normalizes to the same record (and the same customer number).
use thiserror::Error;

use crate::model::{NormalizedCustomer, StagingRow};

pub mod care;
pub mod customer_number;
pub mod date;
pub mod name;
pub mod phone;
pub mod street;

pub use care::normalize_care_and_rhythm;
pub use customer_number::customer_number;
pub use date::{next_review_month, parse_date};
pub use name::{normalize_name, PersonName};
pub use phone::normalize_phone;
pub use street::{normalize_street, StreetParts};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("staging row has no customer name")]
    MissingName,
}

/// Normalize every field of a staging row.
/// Address resolution and error classification happen later; the returned record has no
/// coordinate and no error summary yet.
pub fn normalize_row(row: &StagingRow) -> Result<NormalizedCustomer, NormalizeError> {
    let name = normalize_name(row.customer.as_deref().unwrap_or_default())?;
    let street = normalize_street(row.street.as_deref().unwrap_or_default());
    let (care_level, visit_rhythm) =
        normalize_care_and_rhythm(row.care_level.as_deref(), row.visit_rhythm.as_deref());

    let orders = clean_text(row.orders.as_deref());
    let order_flags = OrderFlags::from_orders(orders.as_deref());
    let qs_visit_history = parse_date(row.qs_visit_history.as_deref());

    let customer_number = customer_number(
        &name.last_name,
        name.first_name.as_deref(),
        street.street.as_deref(),
        street.house_number.as_deref(),
    );
    let planned_month = next_review_month(qs_visit_history, visit_rhythm.as_deref());

    Ok(NormalizedCustomer {
        customer_number,
        last_name: name.last_name,
        first_name: name.first_name,
        street: street.street,
        house_number: street.house_number,
        house_number_suffix: street.suffix,
        postal_code: normalize_postal_code(row.postal_code.as_deref()),
        city: normalize_city(row.city.as_deref()),
        phone: normalize_phone(row.phone.as_deref()),
        mobile: normalize_phone(row.mobile.as_deref()),
        birthday: parse_date(row.birthday.as_deref()),
        care_level,
        contract_start: parse_date(row.contract_start.as_deref()),
        contract_end: parse_date(row.contract_end.as_deref()),
        orders,
        sgb_37_3: order_flags.sgb_37_3,
        care_company: order_flags.care_company,
        service_advisor: clean_text(row.service_advisor.as_deref()),
        visit_rhythm,
        qs_visit_date: parse_date(row.qs_visit_date.as_deref()),
        qs_visit_kind: clean_text(row.qs_visit_kind.as_deref()),
        qs_visit_history,
        qs_visit_note_1: clean_text(row.qs_visit_note_1.as_deref()),
        qs_visit_note_2: clean_text(row.qs_visit_note_2.as_deref()),
        planned_month,
        coordinate: None,
        reference_id: None,
        has_errors: false,
        error_reason: None,
    })
}

/// Trim and collapse inner whitespace. Blank input becomes `None`.
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let collapsed = raw?.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub fn normalize_city(raw: Option<&str>) -> Option<String> {
    let city = clean_text(raw)?;
    if city.contains("Mülheim") {
        return Some("Mülheim an der Ruhr".to_owned());
    }
    Some(city)
}

/// Postal codes stay strings: leading zeros are significant.
pub fn normalize_postal_code(raw: Option<&str>) -> Option<String> {
    let code: String = raw?.chars().filter(|c| !c.is_whitespace()).collect();
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

/// Contract types encoded in the free-text orders column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OrderFlags {
    pub sgb_37_3: bool,
    pub care_company: bool,
}

impl OrderFlags {
    pub fn from_orders(orders: Option<&str>) -> Self {
        match orders {
            Some(orders) => OrderFlags {
                sgb_37_3: orders.contains("37.3 SGB"),
                care_company: orders.contains("Pflegefirma"),
            },
            None => OrderFlags::default(),
        }
    }
}

/// Uppercase the first character and lowercase the rest of every space separated token,
/// treating each hyphen separated segment as its own word.
pub(crate) fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|token| {
            token
                .split('-')
                .map(capitalize)
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn capitalize(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
