use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::RwLock;
use tracing::{debug, info};
use crate::core::error::{Error, Result};
use crate::core::types::{Record, Timestamp};
use crate::storage::key::Key;
use crate::storage::{Entry, IndexDefinition, KeyRange, KvStore};

/// One version of a primary entry; `None` is a tombstone.
#[derive(Debug, Clone)]
struct Version {
    timestamp: Timestamp,
    record: Option<Arc<Record>>,
}

/// Lifetime of one index entry: visible from `created` until `deleted`.
#[derive(Debug, Clone, Copy)]
struct Interval {
    created: Timestamp,
    deleted: Option<Timestamp>,
}

impl Interval {
    fn visible_at(&self, at: Timestamp) -> bool {
        self.created <= at && self.deleted.is_none_or(|d| d > at)
    }
}

struct SecondaryIndex {
    definition: IndexDefinition,
    entries: BTreeMap<(Key, Key), Vec<Interval>>,
    building: bool,
}

impl SecondaryIndex {
    fn open(&mut self, index_key: Key, primary: &Key, at: Timestamp) {
        self.entries
            .entry((index_key, primary.clone()))
            .or_default()
            .push(Interval { created: at, deleted: None });
    }

    fn close(&mut self, index_key: Key, primary: &Key, at: Timestamp) {
        if let Some(intervals) = self.entries.get_mut(&(index_key, primary.clone())) {
            if let Some(open) = intervals.iter_mut().rev().find(|i| i.deleted.is_none()) {
                open.deleted = Some(at);
            }
        }
    }

    /// Apply the transition from `old` to `new` for one primary key.
    fn apply(&mut self, primary: &Key, old: Option<&Record>, new: Option<&Record>, at: Timestamp) {
        let old_keys = old.map(|r| self.definition.keys_for(r)).unwrap_or_default();
        let new_keys = new.map(|r| self.definition.keys_for(r)).unwrap_or_default();
        for key in &old_keys {
            if !new_keys.contains(key) {
                self.close(key.clone(), primary, at);
            }
        }
        for key in new_keys {
            if !old_keys.contains(&key) {
                self.open(key, primary, at);
            }
        }
    }

    /// Undo `apply(primary, old, new, at)`.
    fn revert(&mut self, primary: &Key, old: Option<&Record>, new: Option<&Record>, at: Timestamp) {
        let old_keys = old.map(|r| self.definition.keys_for(r)).unwrap_or_default();
        let new_keys = new.map(|r| self.definition.keys_for(r)).unwrap_or_default();
        for key in &new_keys {
            if old_keys.contains(key) {
                continue;
            }
            let entry = (key.clone(), primary.clone());
            let empty = match self.entries.get_mut(&entry) {
                Some(intervals) => {
                    intervals.retain(|i| i.created != at);
                    intervals.is_empty()
                }
                None => false,
            };
            if empty {
                self.entries.remove(&entry);
            }
        }
        for key in &old_keys {
            if new_keys.contains(key) {
                continue;
            }
            if let Some(intervals) = self.entries.get_mut(&(key.clone(), primary.clone())) {
                if let Some(closed) = intervals.iter_mut().rev().find(|i| i.deleted == Some(at)) {
                    closed.deleted = None;
                }
            }
        }
    }
}

/// Ordered in-memory store with version chains per key and versioned
/// secondary indexes.
pub struct MemoryStore {
    primary: RwLock<BTreeMap<Key, Vec<Version>>>,
    indexes: RwLock<HashMap<String, SecondaryIndex>>,
    live_count: AtomicUsize,
}

fn visible(versions: &[Version], at: Timestamp) -> Option<&Version> {
    versions.iter().rev().find(|v| v.timestamp <= at)
}

fn composite_start(bound: &Bound<Key>) -> Bound<(Key, Key)> {
    match bound {
        Bound::Included(k) => Bound::Included((k.clone(), Key::Null)),
        Bound::Excluded(k) => Bound::Excluded((k.clone(), Key::Max)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn composite_end(bound: &Bound<Key>) -> Bound<(Key, Key)> {
    match bound {
        Bound::Included(k) => Bound::Included((k.clone(), Key::Max)),
        Bound::Excluded(k) => Bound::Excluded((k.clone(), Key::Null)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// BTreeMap::range panics on inverted bounds; check first.
fn valid_bounds<T: Ord>(start: &Bound<T>, end: &Bound<T>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s <= e,
        (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => s < e,
        _ => true,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            primary: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(HashMap::new()),
            live_count: AtomicUsize::new(0),
        }
    }

    fn resume_bounds<T: Clone>(
        start: Bound<T>,
        end: Bound<T>,
        after: Option<&T>,
        reverse: bool,
    ) -> (Bound<T>, Bound<T>) {
        match (after, reverse) {
            (Some(a), false) => (Bound::Excluded(a.clone()), end),
            (Some(a), true) => (start, Bound::Excluded(a.clone())),
            (None, _) => (start, end),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &Key, at: Timestamp) -> Result<Option<Entry>> {
        let primary = self.primary.read();
        Ok(primary
            .get(key)
            .and_then(|versions| visible(versions, at))
            .and_then(|v| {
                v.record.as_ref().map(|record| Entry {
                    key: key.clone(),
                    record: record.clone(),
                    version: v.timestamp,
                })
            }))
    }

    fn latest_version(&self, key: &Key) -> Result<Option<Timestamp>> {
        Ok(self
            .primary
            .read()
            .get(key)
            .and_then(|versions| versions.last())
            .map(|v| v.timestamp))
    }

    fn version_at(&self, key: &Key, at: Timestamp) -> Result<Option<Timestamp>> {
        Ok(self
            .primary
            .read()
            .get(key)
            .and_then(|versions| visible(versions, at))
            .map(|v| v.timestamp))
    }

    fn scan(&self, range: &KeyRange, at: Timestamp, after: Option<&Key>, limit: usize) -> Result<Vec<Entry>> {
        let (start, end) = Self::resume_bounds(range.start.clone(), range.end.clone(), after, range.reverse);
        if !valid_bounds(&start, &end) {
            return Ok(Vec::new());
        }
        let primary = self.primary.read();
        let live = |(key, versions): (&Key, &Vec<Version>)| {
            let version = visible(versions, at)?;
            let record = version.record.as_ref()?;
            Some(Entry {
                key: key.clone(),
                record: record.clone(),
                version: version.timestamp,
            })
        };
        let iter = primary.range((start, end));
        let entries = if range.reverse {
            iter.rev().filter_map(live).take(limit).collect()
        } else {
            iter.filter_map(live).take(limit).collect()
        };
        Ok(entries)
    }

    fn scan_index(
        &self,
        attribute: &str,
        range: &KeyRange,
        at: Timestamp,
        after: Option<&(Key, Key)>,
        limit: usize,
    ) -> Result<Vec<(Key, Key)>> {
        let indexes = self.indexes.read();
        let index = indexes
            .get(attribute)
            .ok_or_else(|| Error::client(format!("{} is not indexed", attribute)))?;
        let (start, end) = Self::resume_bounds(
            composite_start(&range.start),
            composite_end(&range.end),
            after,
            range.reverse,
        );
        if !valid_bounds(&start, &end) {
            return Ok(Vec::new());
        }
        let live = |(pair, intervals): (&(Key, Key), &Vec<Interval>)| {
            intervals.iter().any(|i| i.visible_at(at)).then(|| pair.clone())
        };
        let iter = index.entries.range((start, end));
        let pairs = if range.reverse {
            iter.rev().filter_map(live).take(limit).collect()
        } else {
            iter.filter_map(live).take(limit).collect()
        };
        Ok(pairs)
    }

    fn compare_and_put(
        &self,
        key: &Key,
        expected: Option<Timestamp>,
        record: Option<Arc<Record>>,
        version: Timestamp,
    ) -> Result<bool> {
        let mut primary = self.primary.write();
        let versions = primary.entry(key.clone()).or_default();
        let latest = versions.last();
        if latest.map(|v| v.timestamp) != expected {
            debug!(key = %key, ?expected, actual = ?latest.map(|v| v.timestamp), "compare_and_put: version mismatch");
            return Ok(false);
        }
        if latest.is_some_and(|v| v.timestamp >= version) {
            return Err(Error::internal(format!(
                "write to {} at {} is not newer than its latest version",
                key, version
            )));
        }
        let old = latest.and_then(|v| v.record.clone());
        match (old.is_some(), record.is_some()) {
            (false, true) => {
                self.live_count.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.live_count.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        {
            let mut indexes = self.indexes.write();
            for index in indexes.values_mut() {
                index.apply(key, old.as_deref(), record.as_deref(), version);
            }
        }
        versions.push(Version { timestamp: version, record });
        Ok(true)
    }

    fn remove_version(&self, key: &Key, version: Timestamp) -> Result<bool> {
        let mut primary = self.primary.write();
        let Some(versions) = primary.get_mut(key) else {
            return Ok(false);
        };
        if versions.last().map(|v| v.timestamp) != Some(version) {
            return Ok(false);
        }
        let Some(undone) = versions.pop() else {
            return Ok(false);
        };
        let previous = versions.last().and_then(|v| v.record.clone());
        match (previous.is_some(), undone.record.is_some()) {
            (false, true) => {
                self.live_count.fetch_sub(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.live_count.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        let empty = versions.is_empty();
        if empty {
            primary.remove(key);
        }
        {
            let mut indexes = self.indexes.write();
            for index in indexes.values_mut() {
                index.revert(key, previous.as_deref(), undone.record.as_deref(), version);
            }
        }
        debug!(key = %key, version, "version rolled back");
        Ok(true)
    }

    fn entry_count(&self) -> Result<usize> {
        Ok(self.live_count.load(Ordering::Relaxed))
    }

    fn index_value_count(&self, attribute: &str, key: &Key) -> Result<usize> {
        let indexes = self.indexes.read();
        let Some(index) = indexes.get(attribute) else {
            return Ok(0);
        };
        let range = (
            Bound::Included((key.clone(), Key::Null)),
            Bound::Included((key.clone(), Key::Max)),
        );
        Ok(index
            .entries
            .range(range)
            .filter(|(_, intervals)| intervals.iter().any(|i| i.deleted.is_none()))
            .count())
    }

    fn index_summary(&self, attribute: &str) -> Result<(usize, usize)> {
        let indexes = self.indexes.read();
        let Some(index) = indexes.get(attribute) else {
            return Ok((0, 0));
        };
        let mut entries = 0;
        let mut distinct = 0;
        let mut last: Option<&Key> = None;
        for ((index_key, _), intervals) in index.entries.iter() {
            if !intervals.iter().any(|i| i.deleted.is_none()) {
                continue;
            }
            entries += 1;
            if last != Some(index_key) {
                distinct += 1;
                last = Some(index_key);
            }
        }
        Ok((entries, distinct))
    }

    fn has_index(&self, attribute: &str) -> bool {
        self.indexes.read().contains_key(attribute)
    }

    fn is_index_building(&self, attribute: &str) -> bool {
        self.indexes.read().get(attribute).is_some_and(|i| i.building)
    }

    fn define_index(&self, definition: IndexDefinition) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&definition.attribute) {
            return Ok(());
        }
        info!(attribute = %definition.attribute, "index defined, awaiting population");
        indexes.insert(
            definition.attribute.clone(),
            SecondaryIndex {
                definition,
                entries: BTreeMap::new(),
                building: true,
            },
        );
        Ok(())
    }

    fn populate_index(&self, attribute: &str) -> Result<()> {
        // primary before indexes, same order as compare_and_put
        let primary = self.primary.read();
        let mut indexes = self.indexes.write();
        let index = indexes
            .get_mut(attribute)
            .ok_or_else(|| Error::not_found(format!("no index defined for {}", attribute)))?;
        index.entries.clear();
        for (key, versions) in primary.iter() {
            let mut previous: Option<&Record> = None;
            for version in versions {
                index.apply(key, previous, version.record.as_deref(), version.timestamp);
                previous = version.record.as_deref();
            }
        }
        index.building = false;
        info!(attribute, entries = index.entries.len(), "index populated");
        Ok(())
    }

    fn vacuum(&self, horizon: Timestamp) -> Result<usize> {
        let mut removed = 0;
        {
            let mut primary = self.primary.write();
            for versions in primary.values_mut() {
                // keep the newest version visible at the horizon and everything after it
                let keep_from = versions
                    .iter()
                    .rposition(|v| v.timestamp <= horizon)
                    .unwrap_or(0);
                removed += keep_from;
                versions.drain(..keep_from);
            }
            primary.retain(|_, versions| {
                // empty chains are left behind by failed compare_and_put calls
                let dead = versions.is_empty()
                    || (versions.len() == 1
                        && versions[0].record.is_none()
                        && versions[0].timestamp <= horizon);
                if dead {
                    removed += 1;
                }
                !dead
            });
        }
        let mut indexes = self.indexes.write();
        for index in indexes.values_mut() {
            for intervals in index.entries.values_mut() {
                intervals.retain(|i| i.deleted.is_none_or(|d| d > horizon));
            }
            index.entries.retain(|_, intervals| !intervals.is_empty());
        }
        debug!(horizon, removed, "vacuum finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(json: serde_json::Value) -> Option<Arc<Record>> {
        Some(Arc::new(Record::from_json(json).unwrap()))
    }

    fn age_index() -> IndexDefinition {
        IndexDefinition {
            attribute: "age".into(),
            multi_valued: false,
            index_nulls: true,
            max_key_bytes: 64,
        }
    }

    #[test]
    fn snapshot_reads_see_old_versions() {
        let store = MemoryStore::new();
        let key = Key::Int(1);
        assert!(store.compare_and_put(&key, None, record(json!({"v": 1})), 10).unwrap());
        assert!(store.compare_and_put(&key, Some(10), record(json!({"v": 2})), 20).unwrap());
        assert_eq!(store.get(&key, 15).unwrap().unwrap().version, 10);
        assert_eq!(store.get(&key, 25).unwrap().unwrap().version, 20);
        assert!(store.get(&key, 5).unwrap().is_none());
    }

    #[test]
    fn stale_compare_and_put_fails() {
        let store = MemoryStore::new();
        let key = Key::Int(1);
        store.compare_and_put(&key, None, record(json!({"v": 1})), 10).unwrap();
        assert!(!store.compare_and_put(&key, None, record(json!({"v": 2})), 20).unwrap());
        assert_eq!(store.latest_version(&key).unwrap(), Some(10));
    }

    #[test]
    fn tombstones_hide_records_and_update_counts() {
        let store = MemoryStore::new();
        let key = Key::Int(1);
        store.compare_and_put(&key, None, record(json!({"v": 1})), 10).unwrap();
        assert_eq!(store.entry_count().unwrap(), 1);
        store.compare_and_put(&key, Some(10), None, 20).unwrap();
        assert_eq!(store.entry_count().unwrap(), 0);
        assert!(store.get(&key, 30).unwrap().is_none());
        assert_eq!(store.version_at(&key, 30).unwrap(), Some(20));
        assert_eq!(store.version_at(&key, 15).unwrap(), Some(10));
        assert!(store.scan(&KeyRange::all(), 30, None, 10).unwrap().is_empty());
    }

    #[test]
    fn scan_resumes_after_last_key_in_both_directions() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.compare_and_put(&Key::Int(i), None, record(json!({"i": i})), 10).unwrap();
        }
        let first = store.scan(&KeyRange::all(), 10, None, 2).unwrap();
        let next = store.scan(&KeyRange::all(), 10, Some(&first[1].key), 2).unwrap();
        assert_eq!(next[0].key, Key::Int(2));
        let reverse = KeyRange::all().reversed(true);
        let back = store.scan(&reverse, 10, Some(&Key::Int(3)), 10).unwrap();
        assert_eq!(back.iter().map(|e| e.key.clone()).collect::<Vec<_>>(), vec![Key::Int(2), Key::Int(1), Key::Int(0)]);
    }

    #[test]
    fn index_entries_are_versioned() {
        let store = MemoryStore::new();
        store.define_index(age_index()).unwrap();
        store.populate_index("age").unwrap();
        let key = Key::Int(1);
        store.compare_and_put(&key, None, record(json!({"age": 30})), 10).unwrap();
        store.compare_and_put(&key, Some(10), record(json!({"age": 31})), 20).unwrap();
        let thirty = KeyRange::exact(Key::Int(30));
        assert_eq!(store.scan_index("age", &thirty, 15, None, 10).unwrap().len(), 1);
        assert!(store.scan_index("age", &thirty, 25, None, 10).unwrap().is_empty());
        assert_eq!(store.index_value_count("age", &Key::Int(31)).unwrap(), 1);
    }

    #[test]
    fn index_summary_counts_live_entries_and_keys() {
        let store = MemoryStore::new();
        store.define_index(age_index()).unwrap();
        store.populate_index("age").unwrap();
        for (id, age) in [(1, 30), (2, 30), (3, 30), (4, 41)] {
            store.compare_and_put(&Key::Int(id), None, record(json!({"age": age})), 10).unwrap();
        }
        assert_eq!(store.index_summary("age").unwrap(), (4, 2));
        store.compare_and_put(&Key::Int(4), Some(10), None, 20).unwrap();
        assert_eq!(store.index_summary("age").unwrap(), (3, 1));
        assert_eq!(store.index_summary("missing").unwrap(), (0, 0));
    }

    #[test]
    fn populate_builds_from_existing_history() {
        let store = MemoryStore::new();
        store.compare_and_put(&Key::Int(1), None, record(json!({"age": 30})), 10).unwrap();
        store.define_index(age_index()).unwrap();
        assert!(store.is_index_building("age"));
        store.populate_index("age").unwrap();
        assert!(!store.is_index_building("age"));
        assert_eq!(store.scan_index("age", &KeyRange::exact(Key::Int(30)), 10, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn removed_versions_restore_the_previous_state() {
        let store = MemoryStore::new();
        store.define_index(age_index()).unwrap();
        store.populate_index("age").unwrap();
        let key = Key::Int(1);
        store.compare_and_put(&key, None, record(json!({"age": 30})), 10).unwrap();
        store.compare_and_put(&key, Some(10), record(json!({"age": 31})), 20).unwrap();
        assert!(!store.remove_version(&key, 10).unwrap());
        assert!(store.remove_version(&key, 20).unwrap());
        assert_eq!(store.latest_version(&key).unwrap(), Some(10));
        assert_eq!(store.index_value_count("age", &Key::Int(30)).unwrap(), 1);
        assert_eq!(store.index_value_count("age", &Key::Int(31)).unwrap(), 0);
        assert_eq!(store.scan_index("age", &KeyRange::exact(Key::Int(30)), 30, None, 10).unwrap().len(), 1);

        assert!(store.remove_version(&key, 10).unwrap());
        assert_eq!(store.latest_version(&key).unwrap(), None);
        assert_eq!(store.entry_count().unwrap(), 0);
        assert!(store.scan_index("age", &KeyRange::all(), 30, None, 10).unwrap().is_empty());
    }

    #[test]
    fn vacuum_drops_unreachable_versions() {
        let store = MemoryStore::new();
        let key = Key::Int(1);
        store.compare_and_put(&key, None, record(json!({"v": 1})), 10).unwrap();
        store.compare_and_put(&key, Some(10), record(json!({"v": 2})), 20).unwrap();
        assert_eq!(store.vacuum(25).unwrap(), 1);
        assert_eq!(store.get(&key, 25).unwrap().unwrap().version, 20);
    }
}
