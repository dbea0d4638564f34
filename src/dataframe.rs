//! The in-memory tabular value the dataframe overlay operates on.
//!
//! This is the Rust-native counterpart of the original's `pandas.DataFrame`
//! (pandas itself is out of scope, see `spec.md` §1): an ordered sequence of
//! rows keyed by an `i64` index, each row carrying an arbitrary JSON-ish
//! value map. Encoding is `gzip(rmp-serde(rows))`, matching the original's
//! `gzip.open` + pickle framing (`dfs/helpers.py::serialize_df`/
//! `deserialize_df`) but using the teacher's own `rmp-serde` format instead
//! of a language-specific pickle.
use std::io::{Read, Write};
use std::mem;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::CacheError;

/// A single row: an `i64` index (the original's frequent use is a
/// timestamp) plus an arbitrary column map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub index: i64,
    pub columns: serde_json::Map<String, Json>,
}

/// An ordered, index-deduplicated table of rows.
///
/// `TabularValue` makes no promises about row order beyond what `append`
/// establishes (ascending by `index`); a value read straight off disk
/// before any `append` keeps whatever order it was written in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularValue {
    pub rows: Vec<Row>,
}

impl TabularValue {
    pub fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Deep memory footprint, the dataframe overlay's `size_bytes`
    /// (spec §3, `CacheEntry.size_bytes`: "for tabular blobs it is the deep
    /// memory footprint of the decoded in-memory structure").
    pub fn memory_usage(&self) -> usize {
        mem::size_of::<Self>()
            + self
                .rows
                .iter()
                .map(|row| mem::size_of::<Row>() + json_memory_usage(&Json::Object(row.columns.clone())))
                .sum::<usize>()
    }

    /// Concatenates `self` with `incremental`, sorts by index ascending,
    /// and drops duplicate indices keeping the first occurrence (spec
    /// §4.2, `append` step 2; spec §9 "Open questions", keep-first is
    /// binding even though keep-last would also be reasonable).
    pub fn merge(mut self, incremental: TabularValue) -> TabularValue {
        self.rows.extend(incremental.rows);
        self.rows.sort_by_key(|row| row.index);
        let mut seen = std::collections::HashSet::new();
        self.rows.retain(|row| seen.insert(row.index));
        self
    }

    /// Applies the `df:filter` range semantics (spec §4.2, `get_dataframe`):
    /// `timestamp` ranges filter by index comparison, anything else slices
    /// positionally on the already-ordered sequence.
    pub fn range(&self, start: Option<i64>, end: Option<i64>, range_type: Option<&str>) -> TabularValue {
        if range_type == Some("timestamp") {
            let rows = self
                .rows
                .iter()
                .filter(|row| start.map_or(true, |s| row.index >= s))
                .filter(|row| end.map_or(true, |e| row.index <= e))
                .cloned()
                .collect();
            TabularValue { rows }
        } else {
            let lo = start.map(|s| s.max(0) as usize).unwrap_or(0).min(self.rows.len());
            let hi = end.map(|e| e.max(0) as usize).unwrap_or(self.rows.len()).min(self.rows.len());
            if lo >= hi {
                return TabularValue::empty();
            }
            TabularValue { rows: self.rows[lo..hi].to_vec() }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        if self.rows.is_empty() {
            return Ok(Vec::new());
        }
        let packed = rmp_serde::to_vec(self)
            .map_err(|e| CacheError::EncodingError(format!("msgpack encode: {e}")))?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&packed)
            .map_err(|e| CacheError::EncodingError(format!("gzip encode: {e}")))?;
        gz.finish()
            .map_err(|e| CacheError::EncodingError(format!("gzip finish: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.is_empty() {
            return Ok(TabularValue::empty());
        }
        let mut gz = GzDecoder::new(bytes);
        let mut packed = Vec::new();
        gz.read_to_end(&mut packed)
            .map_err(|e| CacheError::EncodingError(format!("gzip decode: {e}")))?;
        rmp_serde::from_slice(&packed)
            .map_err(|e| CacheError::EncodingError(format!("msgpack decode: {e}")))
    }
}

fn json_memory_usage(value: &Json) -> usize {
    match value {
        Json::Null | Json::Bool(_) => mem::size_of::<Json>(),
        Json::Number(_) => mem::size_of::<Json>(),
        Json::String(s) => mem::size_of::<Json>() + s.capacity(),
        Json::Array(items) => mem::size_of::<Json>() + items.iter().map(json_memory_usage).sum::<usize>(),
        Json::Object(map) => {
            mem::size_of::<Json>()
                + map
                    .iter()
                    .map(|(k, v)| k.capacity() + json_memory_usage(v))
                    .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: i64, v: i64) -> Row {
        let mut columns = serde_json::Map::new();
        columns.insert("v".into(), Json::from(v));
        Row { index, columns }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let value = TabularValue { rows: vec![row(1, 10), row(2, 20)] };
        let encoded = value.encode().unwrap();
        let decoded = TabularValue::decode(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn empty_value_round_trips() {
        let value = TabularValue::empty();
        let encoded = value.encode().unwrap();
        assert!(encoded.is_empty());
        let decoded = TabularValue::decode(&encoded).unwrap();
        assert_eq!(decoded, TabularValue::empty());
    }

    #[test]
    fn merge_sorts_and_dedupes_keeping_first() {
        let a = TabularValue { rows: vec![row(1, 1), row(5, 5)] };
        let b = TabularValue { rows: vec![row(4, 40), row(5, 500), row(8, 8)] };
        let merged = a.merge(b);
        let indices: Vec<i64> = merged.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 4, 5, 8]);
        let five = merged.rows.iter().find(|r| r.index == 5).unwrap();
        assert_eq!(five.columns.get("v"), Some(&Json::from(5)));
    }

    #[test]
    fn timestamp_range_is_inclusive_both_ends() {
        let value = TabularValue { rows: vec![row(1, 1), row(2, 2), row(3, 3), row(4, 4)] };
        let filtered = value.range(Some(2), Some(3), Some("timestamp"));
        let indices: Vec<i64> = filtered.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![2, 3]);
    }

    #[test]
    fn positional_range_slices_by_position() {
        let value = TabularValue { rows: vec![row(10, 0), row(20, 0), row(30, 0), row(40, 0)] };
        let filtered = value.range(Some(1), Some(3), None);
        let indices: Vec<i64> = filtered.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![20, 30]);
    }

    #[test]
    fn absent_bounds_return_whole_value() {
        let value = TabularValue { rows: vec![row(1, 0), row(2, 0)] };
        assert_eq!(value.range(None, None, None), value);
    }
}
