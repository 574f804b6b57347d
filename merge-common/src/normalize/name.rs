use super::{title_case, NormalizeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonName {
    pub first_name: Option<String>,
    pub last_name: String,
}

/// Split an export name of the form "Surname, Givenname" and title-case both parts.
/// Hyphenated names are title-cased per segment ("anna-lena" becomes "Anna-Lena").
pub fn normalize_name(raw: &str) -> Result<PersonName, NormalizeError> {
    let mut parts = raw
        .split(',')
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|part| !part.is_empty());

    let last_name = parts.next().ok_or(NormalizeError::MissingName)?;
    let first_name = parts.next().map(|part| title_case(&part));

    Ok(PersonName {
        first_name,
        last_name: title_case(&last_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(
            normalize_name("mustermann, max").unwrap(),
            PersonName {
                first_name: Some("Max".to_owned()),
                last_name: "Mustermann".to_owned(),
            }
        );
        assert_eq!(
            normalize_name("müller,  anna-lena ").unwrap(),
            PersonName {
                first_name: Some("Anna-Lena".to_owned()),
                last_name: "Müller".to_owned(),
            }
        );
        assert_eq!(
            normalize_name("o'brien-smith, anna-lena").unwrap(),
            PersonName {
                first_name: Some("Anna-Lena".to_owned()),
                last_name: "O'brien-Smith".to_owned(),
            }
        );
    }

    #[test]
    fn test_normalize_name_without_given_name() {
        let name = normalize_name("SCHMIDT").unwrap();

        assert_eq!(name.last_name, "Schmidt");
        assert_eq!(name.first_name, None);
    }

    #[test]
    fn test_normalize_empty_name() {
        assert_eq!(normalize_name(""), Err(NormalizeError::MissingName));
        assert_eq!(normalize_name(" , "), Err(NormalizeError::MissingName));
    }
}
