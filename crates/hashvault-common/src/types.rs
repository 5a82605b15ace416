//! The `HASH:COUNT` record and its validation rules

use serde::{Deserialize, Serialize};

use crate::error::{HashvaultError, RecordError};

/// Length of a hex-encoded SHA-1 digest, the default key width.
pub const DEFAULT_HASH_LENGTH: usize = 40;

/// Largest count that fits the `BIGINT` column of the canonical table.
pub const MAX_COUNT: u64 = i64::MAX as u64;

/// Field delimiter of the input format (and of the COPY stream).
pub const DELIMITER: char = ':';

/// A validated record: an uppercase hex hash and its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRecord {
    pub hash: String,
    pub count: u64,
}

impl HashRecord {
    pub fn new(hash: impl Into<String>, count: u64) -> Self {
        Self {
            hash: hash.into(),
            count,
        }
    }
}

impl std::fmt::Display for HashRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.hash, DELIMITER, self.count)
    }
}

/// Parse one input line into a [`HashRecord`].
///
/// The hash is uppercased. When `expected_hash_len` is `Some`, hashes of any
/// other length are rejected.
pub fn parse_line(line: &str, expected_hash_len: Option<usize>) -> Result<HashRecord, RecordError> {
    let (hash, count) = line
        .trim()
        .split_once(DELIMITER)
        .ok_or(RecordError::MissingDelimiter)?;

    if count.contains(DELIMITER) {
        return Err(RecordError::TooManyFields);
    }

    let hash = validate_hash(hash.trim(), expected_hash_len)?;
    let count = parse_count(count.trim())?;

    Ok(HashRecord { hash, count })
}

/// Normalize a lookup key to the form stored in the canonical table.
///
/// # Example
///
/// ```
/// use hashvault_common::types::normalize_hash;
///
/// let key = normalize_hash(" 5baa61e4c9b93f3f0682250b6cf8331b7ee68fd8 ", Some(40)).unwrap();
/// assert_eq!(key, "5BAA61E4C9B93F3F0682250B6CF8331B7EE68FD8");
/// ```
pub fn normalize_hash(input: &str, expected_len: Option<usize>) -> crate::Result<String> {
    validate_hash(input.trim(), expected_len).map_err(HashvaultError::from)
}

fn validate_hash(hash: &str, expected_len: Option<usize>) -> Result<String, RecordError> {
    if hash.is_empty() {
        return Err(RecordError::EmptyHash);
    }
    if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RecordError::InvalidHash);
    }
    if let Some(expected) = expected_len {
        if hash.len() != expected {
            return Err(RecordError::HashLength {
                expected,
                actual: hash.len(),
            });
        }
    }
    Ok(hash.to_ascii_uppercase())
}

fn parse_count(count: &str) -> Result<u64, RecordError> {
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RecordError::InvalidCount);
    }
    match count.parse::<u64>() {
        Ok(value) if value <= MAX_COUNT => Ok(value),
        _ => Err(RecordError::CountOutOfRange(count.to_string())),
    }
}
