//! Common types for wacast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants
pub type TenantId = Uuid;

/// Unique identifier for contacts
pub type ContactId = Uuid;

/// Unique identifier for contact groups
pub type GroupId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for dispatch tasks
pub type TaskId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Shortest accepted normalized number (country code included)
const MIN_PHONE_DIGITS: usize = 8;

/// E.164 upper bound
const MAX_PHONE_DIGITS: usize = 15;

/// Rules used to bring a raw phone string into international form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneRules {
    /// Country calling code prepended to local numbers, digits only
    pub country_code: String,
    /// Local trunk prefix replaced by the country code
    pub trunk_prefix: String,
}

impl Default for PhoneRules {
    fn default() -> Self {
        Self {
            country_code: "972".to_string(),
            trunk_prefix: "0".to_string(),
        }
    }
}

/// A phone number normalized to `{countryCode}{localNumber}` digits
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize a raw phone string.
    ///
    /// Every non-digit is stripped. A leading `00` international dialing
    /// prefix is dropped, a leading trunk prefix is replaced by the country
    /// code, anything else is taken as already international. Returns `None`
    /// when the result is not a plausible number.
    pub fn normalize(raw: &str, rules: &PhoneRules) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

        let international = if let Some(rest) = digits.strip_prefix("00") {
            rest.to_string()
        } else if !rules.trunk_prefix.is_empty() && digits.starts_with(&rules.trunk_prefix) {
            format!("{}{}", rules.country_code, &digits[rules.trunk_prefix.len()..])
        } else {
            digits
        };

        if international.len() < MIN_PHONE_DIGITS || international.len() > MAX_PHONE_DIGITS {
            return None;
        }
        if international.starts_with('0') {
            return None;
        }

        Some(Self(international))
    }

    /// Wrap an already normalized value read back from storage
    pub fn from_normalized(digits: impl Into<String>) -> Self {
        Self(digits.into())
    }

    /// Digits-only representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `text` mentions any of `keywords`, ignoring case.
///
/// ASCII keywords must match a whole word. Other keywords may appear inside
/// a word, so inflected Hebrew forms such as "להסרה" count for "הסר".
pub fn contains_keyword(text: &str, keywords: &[String]) -> bool {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    keywords.iter().any(|keyword| {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            return false;
        }
        if keyword.is_ascii() {
            words.iter().any(|w| *w == keyword)
        } else {
            words.iter().any(|w| w.contains(keyword.as_str()))
        }
    })
}

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn normalize(raw: &str) -> Option<String> {
        PhoneNumber::normalize(raw, &PhoneRules::default()).map(|p| p.as_str().to_string())
    }

    #[test]
    fn test_mixed_formats_converge() {
        assert_eq!(normalize("0501234567").as_deref(), Some("972501234567"));
        assert_eq!(normalize("+972502345678").as_deref(), Some("972502345678"));
        assert_eq!(normalize("972503456789").as_deref(), Some("972503456789"));
        assert_eq!(normalize("050-123-4567").as_deref(), Some("972501234567"));
        assert_eq!(normalize("00972501234567").as_deref(), Some("972501234567"));
    }

    #[test]
    fn test_rejects_implausible_numbers() {
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("12345"), None);
        assert_eq!(normalize("not a number"), None);
        assert_eq!(normalize("1234567890123456"), None);
    }

    #[test]
    fn test_contains_keyword_is_case_insensitive_and_word_bound() {
        let keywords = vec!["stop".to_string(), "הסר".to_string()];
        assert!(contains_keyword("Reply STOP to opt out", &keywords));
        assert!(contains_keyword("stop.", &keywords));
        assert!(contains_keyword("להסרה שלחו הסר", &keywords));
        assert!(!contains_keyword("unstoppable deals", &keywords));
        assert!(!contains_keyword("anything", &[]));
    }

    #[test]
    fn test_contains_keyword_matches_inflected_hebrew() {
        let keywords = vec!["stop".to_string(), "הסר".to_string()];
        assert!(contains_keyword("מבצע היום, להסרה השיבו כאן", &keywords));
        assert!(contains_keyword("ההסרה מיידית", &keywords));
        assert!(!contains_keyword("מבצע היום בלבד", &keywords));
    }

    #[test]
    fn test_custom_country_rules() {
        let rules = PhoneRules {
            country_code: "44".to_string(),
            trunk_prefix: "0".to_string(),
        };
        let phone = PhoneNumber::normalize("07700 900123", &rules).unwrap();
        assert_eq!(phone.as_str(), "447700900123");
    }
}
