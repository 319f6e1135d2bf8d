//! Decoding of Deribit option instrument identifiers.
//!
//! Identifiers look like `BTC-19JUL19-10000-P`: asset symbol, expiry as
//! day/abbreviated month/two-digit year, integer strike and a `C`/`P` class.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

const FIELD_SEPARATOR: char = '-';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
}

impl OptionType {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "C" => Some(OptionType::Call),
            "P" => Some(OptionType::Put),
            _ => None,
        }
    }

    pub fn code(&self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "CALL"),
            OptionType::Put => write!(f, "PUT"),
        }
    }
}

/// Structured form of an instrument identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentKey {
    pub asset: String,
    pub expiry: NaiveDate,
    pub strike: i64,
    pub option_type: OptionType,
}

impl InstrumentKey {
    /// Canonical identifier: unpadded day, upper-case month, two-digit year.
    pub fn to_identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}{}{:02}-{}-{}",
            self.asset,
            self.expiry.day(),
            self.expiry.format("%b").to_string().to_uppercase(),
            self.expiry.year().rem_euclid(100),
            self.strike,
            self.option_type.code()
        )
    }
}

impl FromStr for InstrumentKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_instrument(s)
    }
}

/// Decode an instrument identifier into its key.
///
/// Never panics: every malformed input maps to a [`DecodeError`].
pub fn decode_instrument(identifier: &str) -> Result<InstrumentKey, DecodeError> {
    let fields: Vec<&str> = identifier.split(FIELD_SEPARATOR).collect();
    if fields.len() != 4 {
        return Err(DecodeError::FieldCount {
            identifier: identifier.to_string(),
            found: fields.len(),
        });
    }

    let asset = fields[0];
    if asset.is_empty() {
        return Err(DecodeError::InvalidAsset {
            identifier: identifier.to_string(),
            asset: asset.to_string(),
        });
    }

    let expiry = parse_expiry(fields[1]).ok_or_else(|| DecodeError::InvalidExpiry {
        identifier: identifier.to_string(),
        token: fields[1].to_string(),
    })?;

    let strike = parse_strike(fields[2]).ok_or_else(|| DecodeError::InvalidStrike {
        identifier: identifier.to_string(),
        token: fields[2].to_string(),
    })?;

    let option_type =
        OptionType::from_code(fields[3]).ok_or_else(|| DecodeError::InvalidOptionClass {
            identifier: identifier.to_string(),
            code: fields[3].to_string(),
        })?;

    Ok(InstrumentKey {
        asset: asset.to_string(),
        expiry,
        strike,
        option_type,
    })
}

/// `19JUL19` / `9AUG19`. Only three-letter month names are accepted.
fn parse_expiry(token: &str) -> Option<NaiveDate> {
    let bytes = token.as_bytes();
    let day_len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if !(1..=2).contains(&day_len) || bytes.len() != day_len + 5 {
        return None;
    }
    let month = &bytes[day_len..day_len + 3];
    let year = &bytes[day_len + 3..];
    if !month.iter().all(|b| b.is_ascii_alphabetic()) || !year.iter().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    NaiveDate::parse_from_str(token, "%d%b%y").ok()
}

fn parse_strike(token: &str) -> Option<i64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}
