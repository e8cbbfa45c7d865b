//! Shared-string coding table.
//!
//! Metadata strings that occur often across the feature corpus are replaced
//! by small integer codes when features are recoded into packs. Code 0 is
//! reserved and means "inline string follows"; real codes start at 1 and are
//! append-only: once assigned, a code never changes meaning.

use std::collections::HashMap;

use prost::bytes::Buf;
use prost::encoding::{decode_varint, encode_varint};

use crate::store::Store;
use crate::{Error, Result};

/// Minimum number of occurrences for a string to earn a code.
pub const MIN_OCCURRENCES: u64 = 8;

/// Meta key under which the table is persisted.
pub const META_KEY_SHARED_STRINGS: &str = "shared_string_table";

/// The coding table, held in both directions: the persisted `code → string`
/// vector and its derived `string → code` map. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct MetaCoding {
    strings: Vec<String>,
    codes: HashMap<String, u32>,
}

impl MetaCoding {
    /// A table with no entries; every string stays inline.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_strings(strings: Vec<String>) -> Self {
        let codes = strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32 + 1))
            .collect();
        Self { strings, codes }
    }

    /// The code for `s`, or 0 when it is not in the table.
    pub fn code_of(&self, s: &str) -> u32 {
        self.codes.get(s).copied().unwrap_or(0)
    }

    pub fn string_of(&self, code: u32) -> Option<&str> {
        (code > 0)
            .then(|| self.strings.get(code as usize - 1).map(String::as_str))
            .flatten()
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// Extend `existing` with every corpus string seen at least
/// [`MIN_OCCURRENCES`] times. Existing codes are preserved; new strings are
/// appended ordered by descending count, ties lexicographic, so rebuilds are
/// deterministic.
pub fn build_coding<I>(existing: &MetaCoding, corpus: I) -> MetaCoding
where
    I: IntoIterator<Item = String>,
{
    let mut counts: HashMap<String, u64> = HashMap::new();
    for s in corpus {
        *counts.entry(s).or_default() += 1;
    }

    let mut candidates: Vec<(String, u64)> = counts
        .into_iter()
        .filter(|(s, n)| *n >= MIN_OCCURRENCES && existing.code_of(s) == 0)
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut strings = existing.strings.clone();
    strings.extend(candidates.into_iter().map(|(s, _)| s));
    MetaCoding::from_strings(strings)
}

/// Serialize a string table as varint-length-prefixed strings in code order.
pub fn encode_string_table(strings: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    for s in strings {
        encode_varint(s.len() as u64, &mut buf);
        buf.extend_from_slice(s.as_bytes());
    }
    buf
}

/// Inverse of [`encode_string_table`].
pub fn decode_string_table(mut bytes: &[u8]) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    while bytes.has_remaining() {
        let len = decode_varint(&mut bytes)? as usize;
        if len > bytes.remaining() {
            return Err(Error::Invariant(
                "string table entry exceeds buffer".into(),
            ));
        }
        let s = std::str::from_utf8(&bytes[..len])
            .map_err(|_| Error::Invariant("string table entry is not UTF-8".into()))?
            .to_owned();
        bytes.advance(len);
        strings.push(s);
    }
    Ok(strings)
}

/// Load the persisted table from the `meta` partition (empty when absent).
pub fn load_meta_coding(store: &Store) -> Result<MetaCoding> {
    match store.meta_get_raw(META_KEY_SHARED_STRINGS)? {
        Some(bytes) => Ok(MetaCoding::from_strings(decode_string_table(&bytes)?)),
        None => Ok(MetaCoding::empty()),
    }
}

/// Persist the table to the `meta` partition.
pub fn save_meta_coding(store: &Store, coding: &MetaCoding) -> Result<()> {
    store.meta_put_raw(META_KEY_SHARED_STRINGS, &encode_string_table(coding.strings()))
}
