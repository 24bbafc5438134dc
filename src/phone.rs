//! E.164 phone number normalization and equivalence.
//!
//! Every phone number entering the gateway is canonicalized here exactly
//! once; the resolver, stores and dispatcher only ever see the canonical
//! form. The derived country code is advisory and feeds cost pricing only.

use isocountry::CountryCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Error when normalizing a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneError {
    /// Input is empty after stripping separators.
    #[error("phone number cannot be empty")]
    Empty,
    /// Input does not start with '+'.
    #[error("phone number must start with '+' followed by the country code")]
    MissingPlus,
    /// Input contains characters other than ASCII digits and separators.
    #[error("phone number must contain only digits after '+'")]
    NonDigit,
    /// Digit count outside the E.164 range.
    #[error("phone number must have between 10 and 15 digits")]
    InvalidLength,
    /// First digit after '+' is zero.
    #[error("phone number cannot have a leading zero after '+'")]
    LeadingZero,
}

/// A canonical E.164 phone number (`+` followed by 10–15 digits).
///
/// Construction only through [`PhoneNumber::normalize`]; two raw inputs are
/// equivalent iff they normalize to the same `PhoneNumber`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Canonicalize a raw phone representation.
    ///
    /// Strips spaces, dashes, dots and parentheses, then enforces
    /// `+` followed by 10–15 ASCII digits with no leading zero.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sms_gateway::phone::PhoneNumber;
    ///
    /// let n = PhoneNumber::normalize("+1 (555) 123-4567").unwrap();
    /// assert_eq!(n.number.as_str(), "+15551234567");
    /// assert_eq!(n.country.alpha2(), "US");
    /// ```
    pub fn normalize(raw: &str) -> Result<NormalizedPhone, PhoneError> {
        let mut stripped = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                ' ' | '-' | '.' | '(' | ')' => continue,
                _ => stripped.push(c),
            }
        }

        if stripped.is_empty() {
            return Err(PhoneError::Empty);
        }

        let digits = match stripped.strip_prefix('+') {
            Some(rest) => rest,
            None => return Err(PhoneError::MissingPlus),
        };

        if digits.is_empty() {
            return Err(PhoneError::Empty);
        }
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(PhoneError::NonDigit);
        }
        if !(10..=15).contains(&digits.len()) {
            return Err(PhoneError::InvalidLength);
        }
        if digits.starts_with('0') {
            return Err(PhoneError::LeadingZero);
        }

        let country = country_for_digits(digits);
        Ok(NormalizedPhone {
            number: PhoneNumber(format!("+{digits}")),
            country,
        })
    }

    /// Whether two raw representations denote the same number.
    pub fn equivalent(a: &str, b: &str) -> bool {
        match (Self::normalize(a), Self::normalize(b)) {
            (Ok(na), Ok(nb)) => na.number == nb.number,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PhoneNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for PhoneNumber {
    type Err = PhoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::normalize(s)?.number)
    }
}

impl<'de> Deserialize<'de> for PhoneNumber {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(de::Error::custom)
    }
}

impl Serialize for PhoneNumber {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

/// Result of normalization: the canonical number plus an advisory country.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPhone {
    pub number: PhoneNumber,
    pub country: CountryCode,
}

// =============================================================================
// Dial prefix → country
// =============================================================================

/// Longest-prefix dial-code table for the countries the gateway prices.
///
/// `+1` numbers default to US: NANP area codes are not disambiguated here,
/// and the country only feeds the cost table.
const DIAL_PREFIXES: &[(&str, CountryCode)] = &[
    ("380", CountryCode::UKR),
    ("351", CountryCode::PRT),
    ("353", CountryCode::IRL),
    ("44", CountryCode::GBR),
    ("49", CountryCode::DEU),
    ("33", CountryCode::FRA),
    ("34", CountryCode::ESP),
    ("39", CountryCode::ITA),
    ("31", CountryCode::NLD),
    ("48", CountryCode::POL),
    ("46", CountryCode::SWE),
    ("47", CountryCode::NOR),
    ("45", CountryCode::DNK),
    ("41", CountryCode::CHE),
    ("43", CountryCode::AUT),
    ("32", CountryCode::BEL),
    ("52", CountryCode::MEX),
    ("55", CountryCode::BRA),
    ("61", CountryCode::AUS),
    ("64", CountryCode::NZL),
    ("81", CountryCode::JPN),
    ("82", CountryCode::KOR),
    ("86", CountryCode::CHN),
    ("90", CountryCode::TUR),
    ("91", CountryCode::IND),
    ("7", CountryCode::RUS),
    ("1", CountryCode::USA),
];

/// Map leading digits to a country by longest matching dial prefix.
fn country_for_digits(digits: &str) -> CountryCode {
    let mut best: Option<(&str, CountryCode)> = None;
    for &(prefix, country) in DIAL_PREFIXES {
        if digits.starts_with(prefix) {
            match best {
                Some((b, _)) if b.len() >= prefix.len() => {}
                _ => best = Some((prefix, country)),
            }
        }
    }
    // Unknown prefixes still normalize; price at the default rate as US.
    best.map(|(_, c)| c).unwrap_or(CountryCode::USA)
}
