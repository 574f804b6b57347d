use sha1::{Digest, Sha1};

const FIELD_SEPARATOR: u8 = 0x1f;

/// Stable customer number derived from the identifying fields of a normalized record.
///
/// Fields are lowercased before hashing so that spelling fixes in casing alone never mint a new
/// customer. The result is `K` followed by the first 8 bytes of the SHA-1 digest in uppercase hex.
pub fn customer_number(
    last_name: &str,
    first_name: Option<&str>,
    street: Option<&str>,
    house_number: Option<&str>,
) -> String {
    let mut hasher = Sha1::new();
    let fields = [
        Some(last_name),
        first_name,
        street,
        house_number,
    ];
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.unwrap_or_default().trim().to_lowercase().as_bytes());
    }

    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|byte| format!("{byte:02X}")).collect();
    format!("K{hex}")
}
