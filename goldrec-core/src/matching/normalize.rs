//! Value normalization shared by matching, rules and quality scoring.

use crate::models::RawProviderRecord;

/// Honorifics and credential suffixes dropped before name comparison.
const NAME_NOISE: &[&str] = &[
    "dr", "mr", "mrs", "ms", "miss", "prof", "md", "do", "phd", "dds", "dmd", "rn", "np", "pa",
    "pac", "lpn", "jr", "sr", "ii", "iii", "iv", "facp", "facs",
];

/// Strips separators and returns the NPI only if it is exactly ten digits.
pub fn normalize_npi(raw: &str) -> Option<String> {
    let stripped = strip_npi_separators(raw);
    if stripped.len() == 10 && stripped.chars().all(|c| c.is_ascii_digit()) {
        Some(stripped)
    } else {
        None
    }
}

/// Removes whitespace, dashes and dots from an NPI candidate.
pub fn strip_npi_separators(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '.')
        .collect()
}

/// Lowercases, trims and collapses internal whitespace.
pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Name form used for similarity: lowercase words without punctuation,
/// honorifics or credential suffixes.
pub fn normalize_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|word| !NAME_NOISE.contains(&word.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Uppercase alphanumerics only; used for license numbers and facility
/// identifiers.
pub fn normalize_code(value: &str) -> Option<String> {
    let code: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!code.is_empty()).then_some(code)
}

/// First five digits of a postal code.
pub fn normalize_postal_code(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(char::is_ascii_digit).take(5).collect();
    (digits.len() == 5).then_some(digits)
}

/// Normalized first and last name of a provider, falling back to the
/// display name's first and last words.
pub fn provider_name_parts(record: &RawProviderRecord) -> (Option<String>, Option<String>) {
    let first = record
        .first_name
        .as_deref()
        .map(normalize_name)
        .filter(|s| !s.is_empty());
    let last = record
        .last_name
        .as_deref()
        .map(normalize_name)
        .filter(|s| !s.is_empty());
    if first.is_some() && last.is_some() {
        return (first, last);
    }

    let display = normalize_name(&record.comparison_name());
    let words: Vec<&str> = display.split_whitespace().collect();
    let fallback_first = words.first().map(|w| (*w).to_string());
    let fallback_last = if words.len() > 1 {
        words.last().map(|w| (*w).to_string())
    } else {
        None
    };
    (first.or(fallback_first), last.or(fallback_last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_normalize_npi() {
        assert_eq!(normalize_npi("1234567890"), Some("1234567890".to_string()));
        assert_eq!(normalize_npi("123-456-7890"), Some("1234567890".to_string()));
        assert_eq!(normalize_npi(" 12345 67890 "), Some("1234567890".to_string()));
        assert_eq!(normalize_npi("12345"), None);
        assert_eq!(normalize_npi("12345678AB"), None);
        assert_eq!(normalize_npi(""), None);
    }

    #[test]
    fn test_normalize_name_drops_titles_and_punctuation() {
        assert_eq!(normalize_name("Dr. John Smith MD"), "john smith");
        assert_eq!(normalize_name("John A. Smith"), "john a smith");
        assert_eq!(normalize_name("  SMITH,  JOHN  "), "smith john");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Internal   Medicine "), "internal medicine");
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("ca-12 345"), Some("CA12345".to_string()));
        assert_eq!(normalize_code(" - "), None);
    }

    #[test]
    fn test_normalize_postal_code() {
        assert_eq!(normalize_postal_code("02139-4307"), Some("02139".to_string()));
        assert_eq!(normalize_postal_code("021"), None);
    }

    #[test]
    fn test_provider_name_parts_fallback_to_display_name() {
        let mut record = RawProviderRecord::new("cms", "1", Utc::now());
        record.display_name = Some("Dr. Jane Q. Doe".to_string());
        assert_eq!(
            provider_name_parts(&record),
            (Some("jane".to_string()), Some("doe".to_string()))
        );

        record.first_name = Some("Janet".to_string());
        record.last_name = Some("Doe-Ray".to_string());
        assert_eq!(
            provider_name_parts(&record),
            (Some("janet".to_string()), Some("doe ray".to_string()))
        );
    }
}
