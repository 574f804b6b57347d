//! Data-quality rules evaluated on a normalized, resolved customer.
use std::fmt;

use crate::model::NormalizedCustomer;
use crate::normalize::care;

/// Where an address problem exists, and whether it still allows placing the customer on a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    NoAddressIssue,
    AddressGeocodable,
    AddressNotGeocodable,
}

impl AddressClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressClass::NoAddressIssue => "NO_ADDRESS_ISSUE",
            AddressClass::AddressGeocodable => "ADDRESS_GEOCODABLE",
            AddressClass::AddressNotGeocodable => "ADDRESS_NOT_GEOCODABLE",
        }
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorFlags {
    /// No rhythm given; an inferred rhythm counts as missing.
    pub missing_rhythm: bool,
    /// No care level given; an inferred care level counts as missing.
    pub missing_care_level: bool,
    pub inconsistent_care_rhythm: bool,
    pub missing_history_date: bool,
    /// Neither phone nor mobile.
    pub missing_contact: bool,
    pub missing_birthday: bool,
    pub no_geocode: bool,
    pub address_changed: bool,
}

impl ErrorFlags {
    fn as_array(&self) -> [bool; 8] {
        [
            self.missing_rhythm,
            self.missing_care_level,
            self.inconsistent_care_rhythm,
            self.missing_history_date,
            self.missing_contact,
            self.missing_birthday,
            self.no_geocode,
            self.address_changed,
        ]
    }

    pub fn count(&self) -> i32 {
        self.as_array().iter().map(|flag| i32::from(*flag)).sum()
    }

    /// Human readable reason for every raised flag, in a fixed order.
    pub fn reasons(&self) -> Vec<&'static str> {
        const REASONS: [&str; 8] = [
            "Besuchsrhythmus fehlt",
            "Pflegegrad fehlt",
            "Pflegegrad und Besuchsrhythmus passen nicht zusammen",
            "Datum des letzten QS-Besuchs fehlt",
            "Keine Telefonnummer",
            "Geburtstag fehlt",
            "Adresse konnte nicht geocodiert werden",
            "Adresse wurde bei der Normalisierung verändert",
        ];

        self.as_array()
            .iter()
            .zip(REASONS)
            .filter(|(raised, _)| **raised)
            .map(|(_, reason)| reason)
            .collect()
    }
}

/// Per-customer error report, stored keyed by customer number and overwritten on every merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub customer_number: String,
    pub flags: ErrorFlags,
    pub error_count: i32,
    pub address_class: AddressClass,
    /// `"<raw> -> <reconstructed>"` when normalization changed the address.
    pub address_new: Option<String>,
}

impl ErrorReport {
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Newline separated reasons, `None` when nothing was flagged.
    pub fn summary(&self) -> Option<String> {
        let reasons = self.flags.reasons();
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("\n"))
        }
    }
}

/// Evaluate every rule on a customer. `raw_street` is the street text as staged, before
/// normalization.
pub fn classify(customer: &NormalizedCustomer, raw_street: Option<&str>) -> ErrorReport {
    let care_level = customer.care_level.as_deref();
    let rhythm = customer.visit_rhythm.as_deref();

    let raw_street = raw_street.unwrap_or_default();
    let reconstructed = customer.full_street();
    let address_changed = raw_street != reconstructed;

    let flags = ErrorFlags {
        missing_rhythm: rhythm.map_or(true, care::is_inferred),
        missing_care_level: care_level.map_or(true, care::is_inferred),
        inconsistent_care_rhythm: match (care_level, rhythm) {
            (Some(care_level), Some(rhythm)) => !care::is_consistent(care_level, rhythm),
            _ => false,
        },
        missing_history_date: customer.qs_visit_history.is_none(),
        missing_contact: customer.phone.is_none() && customer.mobile.is_none(),
        missing_birthday: customer.birthday.is_none(),
        no_geocode: customer.coordinate.is_none(),
        address_changed,
    };

    let address_class = if !flags.address_changed && !flags.no_geocode {
        AddressClass::NoAddressIssue
    } else if customer.coordinate.is_some() || customer.reference_id.is_some() {
        AddressClass::AddressGeocodable
    } else {
        AddressClass::AddressNotGeocodable
    };

    ErrorReport {
        customer_number: customer.customer_number.clone(),
        flags,
        error_count: flags.count(),
        address_class,
        address_new: address_changed.then(|| format!("{} -> {}", raw_street, reconstructed)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::model::Coordinate;

    use super::*;

    fn complete_customer() -> NormalizedCustomer {
        NormalizedCustomer {
            customer_number: "K0011223344556677".to_owned(),
            last_name: "Mustermann".to_owned(),
            first_name: Some("Max".to_owned()),
            street: Some("Musterstraße".to_owned()),
            house_number: Some("12".to_owned()),
            house_number_suffix: Some("a".to_owned()),
            postal_code: Some("47051".to_owned()),
            city: Some("Duisburg".to_owned()),
            phone: Some("+49203123456".to_owned()),
            birthday: NaiveDate::from_ymd_opt(1940, 2, 1),
            care_level: Some("Pflegegrad 4".to_owned()),
            visit_rhythm: Some("3 Monate".to_owned()),
            qs_visit_history: NaiveDate::from_ymd_opt(2024, 1, 20),
            coordinate: Some(Coordinate {
                lon: 6.76,
                lat: 51.43,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_customer_has_no_errors() {
        let report = classify(&complete_customer(), Some("Musterstraße 12a"));

        assert_eq!(report.flags, ErrorFlags::default());
        assert_eq!(report.error_count, 0);
        assert!(!report.has_errors());
        assert_eq!(report.address_class, AddressClass::NoAddressIssue);
        assert_eq!(report.address_new, None);
        assert_eq!(report.summary(), None);
    }

    #[test]
    fn test_address_changed_with_coordinate_is_geocodable() {
        let report = classify(&complete_customer(), Some("Musterstr. 12a"));

        assert!(report.flags.address_changed);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.address_class, AddressClass::AddressGeocodable);
        assert_eq!(
            report.address_new.as_deref(),
            Some("Musterstr. 12a -> Musterstraße 12a")
        );
    }

    #[test]
    fn test_surrounding_blanks_count_as_changed() {
        let report = classify(&complete_customer(), Some(" Musterstraße 12a "));

        assert!(report.flags.address_changed);
        assert_eq!(report.address_class, AddressClass::AddressGeocodable);
        assert_eq!(
            report.address_new.as_deref(),
            Some(" Musterstraße 12a  -> Musterstraße 12a")
        );
    }

    #[test]
    fn test_no_coordinate_without_reference_is_not_geocodable() {
        let customer = NormalizedCustomer {
            coordinate: None,
            ..complete_customer()
        };

        let report = classify(&customer, Some("Musterstraße 12a"));

        assert!(report.flags.no_geocode);
        assert_eq!(report.address_class, AddressClass::AddressNotGeocodable);
    }

    #[test]
    fn test_no_coordinate_with_reference_is_geocodable() {
        let customer = NormalizedCustomer {
            coordinate: None,
            reference_id: Some("DENW-1".to_owned()),
            ..complete_customer()
        };

        let report = classify(&customer, Some("Musterstraße 12a"));

        assert_eq!(report.address_class, AddressClass::AddressGeocodable);
    }

    #[test]
    fn test_inferred_values_count_as_missing() {
        let customer = NormalizedCustomer {
            care_level: Some("Pflegegrad 4*".to_owned()),
            visit_rhythm: Some("3 Monate".to_owned()),
            ..complete_customer()
        };

        let report = classify(&customer, Some("Musterstraße 12a"));

        assert!(report.flags.missing_care_level);
        assert!(!report.flags.missing_rhythm);
        assert!(!report.flags.inconsistent_care_rhythm);
    }

    #[test]
    fn test_inconsistent_care_rhythm() {
        let customer = NormalizedCustomer {
            care_level: Some("Pflegegrad 2".to_owned()),
            visit_rhythm: Some("3 Monate".to_owned()),
            ..complete_customer()
        };

        let report = classify(&customer, Some("Musterstraße 12a"));

        assert!(report.flags.inconsistent_care_rhythm);
        assert_eq!(
            report.summary().as_deref(),
            Some("Pflegegrad und Besuchsrhythmus passen nicht zusammen")
        );
    }

    #[test]
    fn test_error_count_sums_flags() {
        let customer = NormalizedCustomer {
            phone: None,
            mobile: None,
            birthday: None,
            qs_visit_history: None,
            care_level: None,
            visit_rhythm: None,
            coordinate: None,
            ..complete_customer()
        };

        let report = classify(&customer, None);

        assert_eq!(report.error_count, 7);
        assert!(!report.flags.inconsistent_care_rhythm);
        assert_eq!(report.flags.reasons().len(), 7);
        assert_eq!(report.address_class, AddressClass::AddressNotGeocodable);
    }
}
