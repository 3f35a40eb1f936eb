pub mod key;
pub mod memory;
pub mod cursor;

use std::ops::Bound;
use std::sync::Arc;
use crate::core::error::Result;
use crate::core::types::{Record, Timestamp, Value};
use crate::storage::key::Key;

/// One visible primary entry: the record and the version (commit timestamp)
/// that produced it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Key,
    pub record: Arc<Record>,
    pub version: Timestamp,
}

/// Ordered range over keys. Iteration is ascending unless `reverse`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub start: Bound<Key>,
    pub end: Bound<Key>,
    pub reverse: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        KeyRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            reverse: false,
        }
    }

    pub fn exact(key: Key) -> Self {
        KeyRange {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
            reverse: false,
        }
    }

    pub fn new(start: Bound<Key>, end: Bound<Key>) -> Self {
        KeyRange { start, end, reverse: false }
    }

    pub fn reversed(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn contains(&self, key: &Key) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e,
            Bound::Excluded(e) => key < e,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// False when the bounds describe an empty (or inverted) range.
    pub fn is_satisfiable(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s <= e,
            (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => s < e,
            _ => true,
        }
    }
}

/// How a secondary index derives its keys from a record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub attribute: String,
    /// Arrays are indexed per element rather than as one tuple key.
    pub multi_valued: bool,
    pub index_nulls: bool,
    pub max_key_bytes: usize,
}

impl IndexDefinition {
    pub fn keys_for(&self, record: &Record) -> Vec<Key> {
        let value = record.get(&self.attribute).unwrap_or(&Value::Null);
        let mut keys = Vec::new();
        match value {
            Value::Array(items) if self.multi_valued => {
                for item in items.iter() {
                    self.push_key(item, &mut keys);
                }
            }
            single => self.push_key(single, &mut keys),
        }
        keys.sort();
        keys.dedup();
        keys
    }

    fn push_key(&self, value: &Value, keys: &mut Vec<Key>) {
        if value.is_null() && !self.index_nulls {
            return;
        }
        if let Some(key) = Key::index_key(value, self.max_key_bytes) {
            keys.push(key);
        }
    }
}

/// The ordered, versioned key-value engine underneath a collection.
///
/// Reads take a timestamp and see the newest version at or before it.
/// Writes go through `compare_and_put`, which only succeeds while the key's
/// latest version still matches what the writer read.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &Key, at: Timestamp) -> Result<Option<Entry>>;

    /// Version of the newest entry for `key` (tombstones included).
    fn latest_version(&self, key: &Key) -> Result<Option<Timestamp>>;

    /// Version of the entry for `key` visible at `at` (tombstones included).
    fn version_at(&self, key: &Key, at: Timestamp) -> Result<Option<Timestamp>>;

    /// Up to `limit` live entries in `range` visible at `at`, resuming after
    /// `after` in iteration order.
    fn scan(&self, range: &KeyRange, at: Timestamp, after: Option<&Key>, limit: usize) -> Result<Vec<Entry>>;

    /// Up to `limit` `(index key, primary key)` pairs of `attribute`'s index.
    fn scan_index(
        &self,
        attribute: &str,
        range: &KeyRange,
        at: Timestamp,
        after: Option<&(Key, Key)>,
        limit: usize,
    ) -> Result<Vec<(Key, Key)>>;

    /// Write `record` (or a tombstone for `None`) at `version` if the latest
    /// version of `key` is still `expected`. Returns false on mismatch.
    fn compare_and_put(
        &self,
        key: &Key,
        expected: Option<Timestamp>,
        record: Option<Arc<Record>>,
        version: Timestamp,
    ) -> Result<bool>;

    /// Undo the `compare_and_put` that wrote `version` for `key`, index
    /// entries included. Returns false if `version` is no longer the latest.
    fn remove_version(&self, key: &Key, version: Timestamp) -> Result<bool>;

    /// Approximate number of live records.
    fn entry_count(&self) -> Result<usize>;

    /// Approximate number of live index entries equal to `key`.
    fn index_value_count(&self, attribute: &str, key: &Key) -> Result<usize>;

    /// Live entries of `attribute`'s index and the number of distinct index
    /// keys among them.
    fn index_summary(&self, attribute: &str) -> Result<(usize, usize)>;

    fn has_index(&self, attribute: &str) -> bool;

    fn is_index_building(&self, attribute: &str) -> bool;

    /// Register an index; it reports "building" until `populate_index` finishes.
    fn define_index(&self, definition: IndexDefinition) -> Result<()>;

    fn populate_index(&self, attribute: &str) -> Result<()>;

    /// Drop versions no read view at or after `horizon` can observe.
    fn vacuum(&self, horizon: Timestamp) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn range_containment_respects_bounds() {
        let range = KeyRange::new(Bound::Excluded(Key::Int(1)), Bound::Included(Key::Int(5)));
        assert!(!range.contains(&Key::Int(1)));
        assert!(range.contains(&Key::Int(5)));
        assert!(!range.contains(&Key::Int(6)));
    }

    #[test]
    fn inverted_ranges_are_unsatisfiable() {
        assert!(!KeyRange::new(Bound::Included(Key::Int(5)), Bound::Included(Key::Int(1))).is_satisfiable());
        assert!(!KeyRange::new(Bound::Excluded(Key::Int(5)), Bound::Included(Key::Int(5))).is_satisfiable());
        assert!(KeyRange::exact(Key::Int(5)).is_satisfiable());
    }

    #[test]
    fn multi_valued_index_fans_out() {
        let def = IndexDefinition {
            attribute: "tags".into(),
            multi_valued: true,
            index_nulls: true,
            max_key_bytes: 64,
        };
        let record = Record::from_json(json!({"tags": ["b", "a", "b"]})).unwrap();
        assert_eq!(def.keys_for(&record), vec![Key::from("a"), Key::from("b")]);
    }

    #[test]
    fn null_values_skip_non_null_indexes() {
        let def = IndexDefinition {
            attribute: "x".into(),
            multi_valued: false,
            index_nulls: false,
            max_key_bytes: 64,
        };
        assert!(def.keys_for(&Record::new()).is_empty());
    }
}
