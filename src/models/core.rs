// src/models/core.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MatchError;

pub type RunId = i32;
pub type CustomerId = i32;

/// The population every query run is matched against.
pub const BASELINE_RUN: RunId = 0;
pub const BLOCKING_KEY_LEN: usize = 10;

/// One row of `customer_matching`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: CustomerId,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

impl CustomerRecord {
    /// "first last", lower-cased, as used for name tokens.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_lowercase()
    }

    /// Input rows are stored lower-cased.
    pub fn lowercased(mut self) -> Self {
        for field in [
            &mut self.first_name,
            &mut self.last_name,
            &mut self.phone_number,
            &mut self.street,
            &mut self.city,
            &mut self.state,
            &mut self.zip_code,
        ] {
            *field = field.trim().to_lowercase();
        }
        self
    }
}

/// Field a token was drawn from. Tokens of different fields never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldType {
    Street,
    Name,
}

impl FieldType {
    pub const ALL: [FieldType; 2] = [FieldType::Street, FieldType::Name];

    pub fn entity_type_id(self) -> i32 {
        match self {
            FieldType::Street => 1,
            FieldType::Name => 2,
        }
    }

    pub fn from_entity_type_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(FieldType::Street),
            2 => Some(FieldType::Name),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Street => "street",
            FieldType::Name => "name",
        }
    }
}

/// A ten character signature over `{0,1}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BlockingKey(String);

impl BlockingKey {
    /// Builds a key from emitted bits, padding with `0` up to the fixed length.
    pub fn from_bits<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        let mut key: String = bits
            .into_iter()
            .take(BLOCKING_KEY_LEN)
            .map(|bit| if bit { '1' } else { '0' })
            .collect();
        while key.len() < BLOCKING_KEY_LEN {
            key.push('0');
        }
        BlockingKey(key)
    }

    /// Validates a key read back from storage.
    pub fn parse(raw: &str) -> Result<Self, MatchError> {
        if raw.len() == BLOCKING_KEY_LEN && raw.chars().all(|c| c == '0' || c == '1') {
            Ok(BlockingKey(raw.to_string()))
        } else {
            Err(MatchError::Input(format!("malformed blocking key '{}'", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per record, per field, per token weight for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenWeight {
    pub customer_id: CustomerId,
    pub field: FieldType,
    pub token: String,
    pub weight: f64,
    pub run_id: RunId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_padding_and_truncation() {
        assert_eq!(BlockingKey::from_bits(vec![]).as_str(), "0000000000");
        assert_eq!(BlockingKey::from_bits(vec![true]).as_str(), "1000000000");
        let long = BlockingKey::from_bits(std::iter::repeat(true).take(25));
        assert_eq!(long.as_str(), "1111111111");
    }

    #[test]
    fn test_key_parse_rejects_bad_input() {
        assert!(BlockingKey::parse("1010101010").is_ok());
        assert!(BlockingKey::parse("10101").is_err());
        assert!(BlockingKey::parse("10101010x0").is_err());
    }

    #[test]
    fn test_full_name_and_lowercasing() {
        let record = CustomerRecord {
            first_name: " Jane ".into(),
            last_name: "DOE".into(),
            street: "12 Oak Avenue".into(),
            ..Default::default()
        };
        assert_eq!(record.full_name(), "jane doe");
        let lowered = record.lowercased();
        assert_eq!(lowered.street, "12 oak avenue");
        assert_eq!(lowered.first_name, "jane");
    }

    #[test]
    fn test_entity_type_ids_round_trip() {
        for field in FieldType::ALL {
            assert_eq!(FieldType::from_entity_type_id(field.entity_type_id()), Some(field));
        }
        assert_eq!(FieldType::from_entity_type_id(7), None);
    }
}
