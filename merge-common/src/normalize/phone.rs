use phonenumber::{country, Mode};

/// Shortest digit sequence still considered a plausible phone number.
const MIN_PHONE_DIGITS: usize = 6;

/// Normalize a phone number to E.164, assuming German numbers when no country code is given.
///
/// The number is first run through libphonenumber metadata. Numbers the parser rejects fall
/// back to a digit heuristic: keep digits and a leading `+`, turn a `00` prefix into `+`, and
/// prefix bare national numbers with `+49`. Anything left with fewer than six digits is
/// dropped. Never fails; `None` means "no usable number".
pub fn normalize_phone(raw: Option<&str>) -> Option<String> {
    let cleaned = raw?.replace("(0)", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(number) = phonenumber::parse(Some(country::Id::DE), cleaned) {
        if phonenumber::is_valid(&number) {
            return Some(number.format().mode(Mode::E164).to_string());
        }
    }

    heuristic_e164(cleaned)
}

fn heuristic_e164(cleaned: &str) -> Option<String> {
    let mut kept: String = cleaned
        .chars()
        .enumerate()
        .filter(|(index, c)| c.is_ascii_digit() || (*index == 0 && *c == '+'))
        .map(|(_, c)| c)
        .collect();

    if let Some(rest) = kept.strip_prefix("00") {
        kept = format!("+{rest}");
    }

    let digits: String = kept.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }

    if kept.starts_with('+') {
        return Some(format!("+{digits}"));
    }

    let national = digits.strip_prefix('0').unwrap_or(&digits);
    Some(format!("+49{national}"))
}
