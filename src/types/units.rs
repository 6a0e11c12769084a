//! Amount Utilities
//!
//! Ledger amounts are `u128` base units. JSON has no lossless integer type
//! that wide, so amounts cross the API and the database as decimal strings.

/// Parse a base-unit amount, tolerating `,` and `_` separators
pub fn parse_amount(s: &str) -> Option<u128> {
    s.trim().replace([',', '_'], "").parse().ok()
}

/// Signed difference `a - b` between two unsigned totals
pub fn signed_diff(a: u128, b: u128) -> i128 {
    if a >= b {
        i128::try_from(a - b).unwrap_or(i128::MAX)
    } else {
        i128::try_from(b - a).map(|d| -d).unwrap_or(i128::MIN)
    }
}

/// Serde adapter writing `u128` as a decimal string
pub mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_amount(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {}", raw)))
    }
}

/// Serde adapter writing `i128` as a decimal string
pub mod signed_amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid amount: {}", raw)))
    }
}
