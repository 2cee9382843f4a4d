use crate::error::OtpError;
use serde::Serialize;
use std::fmt;

const COUNTRY_PREFIX: &str = "+91";
const DIGITS: usize = 10;

/// A validated 10-digit mobile number, digits only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize user input: drop a leading `+91`, then every non-digit.
    ///
    /// Valid iff exactly ten digits remain and the first is 6, 7, 8 or 9.
    /// Only the literal `+91` prefix is recognized as a country code: `91 …`
    /// and `0091…` keep their extra digits and are rejected, as is a
    /// trunk-prefixed `0…`.
    pub fn parse(raw: &str) -> Result<Self, OtpError> {
        let trimmed = raw.trim();
        let local = trimmed.strip_prefix(COUNTRY_PREFIX).unwrap_or(trimmed);
        let digits: String = local.chars().filter(char::is_ascii_digit).collect();

        let valid = digits.len() == DIGITS && matches!(digits.as_bytes()[0], b'6'..=b'9');
        if !valid {
            return Err(OtpError::InvalidPhone);
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last four digits visible, for logs.
    pub fn masked(&self) -> String {
        let visible = &self.0[self.0.len() - 4..];
        format!("{}{visible}", "*".repeat(self.0.len() - 4))
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        for raw in ["9876543210", "+91 98765 43210", "+91-9876-543-210", "  98765-43210 "] {
            assert_eq!(PhoneNumber::parse(raw).unwrap().as_str(), "9876543210", "{raw}");
        }
    }

    #[test]
    fn test_parse_rejects() {
        for raw in ["5123456789", "987654321", "98765432101", "", "+91", "0987654321", "+1 9876543210"] {
            assert_eq!(PhoneNumber::parse(raw), Err(OtpError::InvalidPhone), "{raw}");
        }
    }

    #[test]
    fn test_only_plus_prefix_is_country_code() {
        assert!(PhoneNumber::parse("+919876543210").is_ok());
        assert!(PhoneNumber::parse("+91 9876543210").is_ok());
        for raw in ["91 9876543210", "919876543210", "0091 9876543210", "09876543210"] {
            assert_eq!(PhoneNumber::parse(raw), Err(OtpError::InvalidPhone), "{raw}");
        }
    }

    #[test]
    fn test_masked() {
        let phone = PhoneNumber::parse("6000003210").unwrap();
        assert_eq!(phone.masked(), "******3210");
    }
}
