use chrono::{Datelike, Duration, Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

static ISO_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})[-./](\d{1,2})[-./](\d{1,2})(?:[T ].*)?$").expect("valid regex")
});
static GERMAN_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[-./](\d{1,2})[-./](\d{4})$").expect("valid regex"));
/// Five-digit serials cover 1927-05-18 to 2173-10-14; shorter numbers are years or noise.
static SPREADSHEET_SERIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{5}(?:\.\d+)?$").expect("valid regex"));
static MONTH_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*Monat").expect("valid regex"));

/// Day zero of spreadsheet serial dates.
fn spreadsheet_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

/// Parse the date notations found in exports: ISO (optionally with a time part),
/// `DD.MM.YYYY` and spreadsheet serial numbers. Anything else is `None`.
pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(captures) = ISO_DATE.captures(raw) {
        return ymd(&captures[1], &captures[2], &captures[3]);
    }
    if let Some(captures) = GERMAN_DATE.captures(raw) {
        return ymd(&captures[3], &captures[2], &captures[1]);
    }
    if SPREADSHEET_SERIAL.is_match(raw) {
        let days = raw.parse::<f64>().ok()?.trunc() as i64;
        return spreadsheet_epoch()?.checked_add_signed(Duration::try_days(days)?);
    }

    None
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

/// The first day of the month the next quality visit is due: the month of the last visit
/// shifted by the rhythm's month count.
pub fn next_review_month(last_visit: Option<NaiveDate>, rhythm: Option<&str>) -> Option<NaiveDate> {
    let last_visit = last_visit?;
    let months: u32 = MONTH_COUNT
        .captures(rhythm?)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    if months == 0 {
        return None;
    }

    last_visit
        .with_day(1)?
        .checked_add_months(Months::new(months))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, month, day)
    }

    #[test]
    fn test_parse_iso_dates() {
        assert_eq!(parse_date(Some("2024-01-20")), date(2024, 1, 20));
        assert_eq!(parse_date(Some("2024-1-5")), date(2024, 1, 5));
        assert_eq!(parse_date(Some("2024-01-20T00:00:00.000Z")), date(2024, 1, 20));
        assert_eq!(parse_date(Some("2024-01-20 13:45")), date(2024, 1, 20));
    }

    #[test]
    fn test_parse_german_dates() {
        assert_eq!(parse_date(Some("01.02.1940")), date(1940, 2, 1));
        assert_eq!(parse_date(Some(" 1.2.1940 ")), date(1940, 2, 1));
        assert_eq!(parse_date(Some("31/12/2023")), date(2023, 12, 31));
    }

    #[test]
    fn test_parse_spreadsheet_serials() {
        assert_eq!(parse_date(Some("10000")), date(1927, 5, 18));
        assert_eq!(parse_date(Some("45311")), date(2024, 1, 20));
        assert_eq!(parse_date(Some("45311.75")), date(2024, 1, 20));
    }

    #[test]
    fn test_parse_invalid_dates() {
        assert_eq!(parse_date(None), None);
        assert_eq!(parse_date(Some("")), None);
        assert_eq!(parse_date(Some("gestern")), None);
        assert_eq!(parse_date(Some("31.02.2024")), None);
        assert_eq!(parse_date(Some("1940")), None);
        assert_eq!(parse_date(Some("1")), None);
        assert_eq!(parse_date(Some("123456")), None);
        assert_eq!(parse_date(Some("2024-13-01")), None);
    }

    #[test]
    fn test_next_review_month() {
        assert_eq!(
            next_review_month(date(2024, 1, 20), Some("3 Monate*")),
            date(2024, 4, 1)
        );
        assert_eq!(
            next_review_month(date(2023, 11, 30), Some("6 Monate")),
            date(2024, 5, 1)
        );
    }

    #[test]
    fn test_next_review_month_needs_both_inputs() {
        assert_eq!(next_review_month(None, Some("6 Monate")), None);
        assert_eq!(next_review_month(date(2024, 1, 20), None), None);
        assert_eq!(next_review_month(date(2024, 1, 20), Some("halbjährlich")), None);
        assert_eq!(next_review_month(date(2024, 1, 20), Some("0 Monate")), None);
    }
}
