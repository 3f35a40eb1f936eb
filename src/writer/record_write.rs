use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use tracing::{debug, warn};
use crate::core::error::{Error, Result};
use crate::core::stats::CollectionStats;
use crate::core::transaction::{SubTransaction, TransactionSet, TransactionState};
use crate::core::types::{Record, Timestamp};
use crate::record::tracked::TrackedRecord;
use crate::schema::schema::Schema;
use crate::storage::KvStore;
use crate::storage::key::Key;

/// Edit applied to a tracked record by `Collection::update`. Kept so it can
/// be replayed on top of a newer version when the commit finds a conflict.
pub type Patch = Arc<dyn Fn(&mut TrackedRecord) -> Result<()> + Send + Sync>;

/// What the transaction intends to do with the record.
enum Intent {
    /// Only read so far.
    Read,
    /// Handed out for in-place editing; written if it has changes.
    Tracked,
    /// Whole-record replacement. Conflicts abort.
    Replace,
    Delete,
    /// Only patches were applied; conflicts re-fetch and replay them.
    Patch(Vec<Patch>),
}

struct WriteState {
    read_version: Option<Timestamp>,
    exists: bool,
    intent: Intent,
    staged: Option<Option<Arc<Record>>>,
    /// Read version the applied write replaced, kept for rollback.
    applied_over: Option<Option<Timestamp>>,
    state: TransactionState,
}

/// The per-record sub-transaction. One instance per (collection, key) and
/// Transaction Set, shared through the set's resource cache, so every read
/// and write of that record inside the set goes through it.
pub struct RecordWrite {
    collection: String,
    key: Key,
    store: Arc<dyn KvStore>,
    schema: Arc<Schema>,
    stats: Arc<CollectionStats>,
    max_retries: usize,
    record: Arc<Mutex<TrackedRecord>>,
    inner: Mutex<WriteState>,
    registered: AtomicBool,
}

impl RecordWrite {
    /// Read `key` at `at` and remember the version seen there as the
    /// compare-and-swap precondition.
    pub fn load(
        collection: &str,
        key: Key,
        store: Arc<dyn KvStore>,
        schema: Arc<Schema>,
        stats: Arc<CollectionStats>,
        at: Timestamp,
        max_retries: usize,
    ) -> Result<Arc<RecordWrite>> {
        let read_version = store.version_at(&key, at)?;
        let entry = store.get(&key, at)?;
        let exists = entry.is_some();
        let tracked = match entry {
            Some(entry) => TrackedRecord::new(entry.record, Some(schema.clone())),
            None => TrackedRecord::new_record(Some(schema.clone())),
        };
        Ok(Arc::new(RecordWrite {
            collection: collection.to_string(),
            key,
            store,
            schema,
            stats,
            max_retries,
            record: Arc::new(Mutex::new(tracked)),
            inner: Mutex::new(WriteState {
                read_version,
                exists,
                intent: Intent::Read,
                staged: None,
                applied_over: None,
                state: TransactionState::Active,
            }),
            registered: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// True for the first caller only; that caller registers the write
    /// with its Transaction Set.
    pub(crate) fn claim_registration(&self) -> bool {
        !self.registered.swap(true, Ordering::SeqCst)
    }

    pub fn read_version(&self) -> Option<Timestamp> {
        self.inner.lock().read_version
    }

    /// True once something other than a plain read happened, i.e. the
    /// write needs to be registered with the Transaction Set.
    pub fn is_writing(&self) -> bool {
        !matches!(self.inner.lock().intent, Intent::Read)
    }

    /// The record as this transaction currently sees it, pending edits
    /// included. `None` when it does not exist or was deleted.
    pub fn current(&self) -> Option<Record> {
        let inner = self.inner.lock();
        if !inner.exists {
            return None;
        }
        Some(self.record.lock().collapse())
    }

    /// Shared handle for in-place edits. Edits made through it are written
    /// at commit if they change anything.
    pub fn handle(&self) -> Option<Arc<Mutex<TrackedRecord>>> {
        let mut inner = self.inner.lock();
        if !inner.exists {
            return None;
        }
        inner.intent = match std::mem::replace(&mut inner.intent, Intent::Read) {
            Intent::Read | Intent::Tracked => Intent::Tracked,
            // patches can't be replayed over edits made through the handle
            Intent::Patch(_) | Intent::Replace => Intent::Replace,
            Intent::Delete => Intent::Delete,
        };
        Some(self.record.clone())
    }

    pub fn put(&self, record: Record) -> Result<()> {
        let record = self.with_identity(self.schema.validate_record(&record)?)?;
        let mut inner = self.inner.lock();
        self.check_active(&inner)?;
        *self.record.lock() = TrackedRecord::new(Arc::new(record), Some(self.schema.clone()));
        inner.exists = true;
        inner.intent = Intent::Replace;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_active(&inner)?;
        inner.exists = false;
        inner.intent = Intent::Delete;
        Ok(())
    }

    /// Apply `patch` now and keep it for replay on conflict.
    pub fn patch(&self, patch: Patch) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_active(&inner)?;
        if !inner.exists {
            return Err(Error::not_found(format!("{} {} does not exist", self.collection, self.key)));
        }
        let had_edits = matches!(inner.intent, Intent::Tracked) && self.record.lock().has_changes();
        patch(&mut *self.record.lock())?;
        inner.intent = match std::mem::replace(&mut inner.intent, Intent::Read) {
            Intent::Read => Intent::Patch(vec![patch]),
            Intent::Tracked if !had_edits => Intent::Patch(vec![patch]),
            Intent::Patch(mut patches) => {
                patches.push(patch);
                Intent::Patch(patches)
            }
            other => other,
        };
        Ok(())
    }

    fn check_active(&self, inner: &WriteState) -> Result<()> {
        if inner.state != TransactionState::Active {
            return Err(Error::invalid_state(format!(
                "write to {} {} is {:?}",
                self.collection, self.key, inner.state
            )));
        }
        Ok(())
    }

    /// Fill in the primary key and reject attempts to change it.
    fn with_identity(&self, mut record: Record) -> Result<Record> {
        let pk = &self.schema.primary_key;
        match record.get(pk).and_then(Key::from_value) {
            Some(existing) if existing != self.key => Err(Error::client(format!(
                "primary key {} of {} cannot change from {} to {}",
                pk, self.collection, self.key, existing
            ))),
            Some(_) => Ok(record),
            None => {
                record.insert(pk.clone(), self.key.to_value());
                Ok(record)
            }
        }
    }

    /// Re-read the newest version and replay the patches on it.
    fn rebase(&self, inner: &mut WriteState, patches: &[Patch]) -> Result<()> {
        for attempt in 1..=self.max_retries.max(1) {
            let latest = self.store.latest_version(&self.key)?;
            let entry = match latest {
                Some(version) => self.store.get(&self.key, version)?,
                None => None,
            };
            let Some(entry) = entry else {
                return Err(Error::conflict(format!(
                    "{} {} was deleted concurrently",
                    self.collection, self.key
                )));
            };
            let mut tracked = TrackedRecord::new(entry.record, Some(self.schema.clone()));
            for patch in patches {
                patch(&mut tracked)?;
            }
            if self.store.latest_version(&self.key)? == latest {
                warn!(
                    collection = %self.collection,
                    key = %self.key,
                    attempt,
                    version = ?latest,
                    "commit conflict, patches replayed on latest version"
                );
                *self.record.lock() = tracked;
                inner.read_version = latest;
                return Ok(());
            }
        }
        Err(Error::conflict(format!(
            "{} {} kept changing; gave up after {} merge attempts",
            self.collection, self.key, self.max_retries
        )))
    }

    fn persists(&self, intent: &Intent) -> bool {
        match intent {
            Intent::Read => false,
            Intent::Tracked | Intent::Patch(_) => self.record.lock().has_changes(),
            Intent::Replace | Intent::Delete => true,
        }
    }
}

impl SubTransaction for RecordWrite {
    fn describe(&self) -> String {
        format!("{} {}", self.collection, self.key)
    }

    fn validate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !self.persists(&inner.intent) {
            return Ok(());
        }
        let latest = self.store.latest_version(&self.key)?;
        if latest == inner.read_version {
            return Ok(());
        }
        let patches = match &inner.intent {
            Intent::Patch(patches) => patches.clone(),
            _ => {
                return Err(Error::conflict(format!(
                    "{} {} changed since it was read (read version {:?}, latest {:?})",
                    self.collection, self.key, inner.read_version, latest
                )));
            }
        };
        self.rebase(&mut inner, &patches)
    }

    fn prepare(&self, timestamp: Timestamp, _set: &TransactionSet) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = TransactionState::Preparing;
        let staged = if !self.persists(&inner.intent) {
            None
        } else if matches!(inner.intent, Intent::Delete) {
            // deleting something that was never there writes nothing
            inner.read_version.map(|_| None)
        } else {
            let collapsed = self.record.lock().collapse();
            let record = self.with_identity(self.schema.validate_record(&collapsed)?)?;
            Some(Some(Arc::new(record)))
        };
        debug!(collection = %self.collection, key = %self.key, timestamp, writes = staged.is_some(), "record write prepared");
        inner.staged = staged;
        Ok(())
    }

    fn apply(&self, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.staged.take() {
            let written = self
                .store
                .compare_and_put(&self.key, inner.read_version, record, timestamp)?;
            if !written {
                return Err(Error::conflict(format!(
                    "{} {} changed between validation and apply",
                    self.collection, self.key
                )));
            }
            inner.applied_over = Some(inner.read_version);
            inner.read_version = Some(timestamp);
            self.stats.invalidate();
        }
        inner.state = TransactionState::Committed;
        Ok(())
    }

    fn rollback(&self, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.applied_over.take() {
            if !self.store.remove_version(&self.key, timestamp)? {
                return Err(Error::internal(format!(
                    "{} {} moved past version {} before it could be rolled back",
                    self.collection, self.key, timestamp
                )));
            }
            inner.read_version = previous;
            self.stats.invalidate();
        }
        inner.state = TransactionState::Aborted;
        Ok(())
    }

    fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.staged = None;
        if inner.state != TransactionState::Committed {
            inner.state = TransactionState::Aborted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::core::error::ErrorKind;
    use crate::core::types::Value;
    use crate::storage::memory::MemoryStore;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new("id"))
    }

    fn stats_for(store: &Arc<MemoryStore>) -> Arc<CollectionStats> {
        Arc::new(CollectionStats::new(store.clone(), &crate::core::config::Config::default()))
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let record = Record::from_json(json!({"id": 1, "count": 0})).unwrap();
        store.compare_and_put(&Key::Int(1), None, Some(Arc::new(record)), 10).unwrap();
        store
    }

    fn stage(write: &RecordWrite, ts: Timestamp) -> Result<()> {
        write.validate()?;
        let mvcc = Arc::new(crate::mvcc::controller::MVCCController::new());
        let set = TransactionSet::begin(mvcc, &crate::core::config::Config::default());
        write.prepare(ts, &set)?;
        write.apply(ts)
    }

    fn increment() -> Patch {
        Arc::new(|record: &mut TrackedRecord| {
            let count = record.get("count").and_then(|v| v.as_f64()).unwrap_or(0.0) as i64;
            record.set("count", Value::Int(count + 1))
        })
    }

    #[test]
    fn untouched_reads_write_nothing() {
        let store = seeded();
        let write = RecordWrite::load("c", Key::Int(1), store.clone(), schema(), stats_for(&store), 10, 3).unwrap();
        stage(&write, 20).unwrap();
        assert_eq!(store.latest_version(&Key::Int(1)).unwrap(), Some(10));
    }

    #[test]
    fn replace_conflicts_abort() {
        let store = seeded();
        let write = RecordWrite::load("c", Key::Int(1), store.clone(), schema(), stats_for(&store), 10, 3).unwrap();
        write.put(Record::from_json(json!({"count": 5})).unwrap()).unwrap();
        let newer = Record::from_json(json!({"id": 1, "count": 9})).unwrap();
        store.compare_and_put(&Key::Int(1), Some(10), Some(Arc::new(newer)), 15).unwrap();
        assert_eq!(write.validate().unwrap_err().kind, ErrorKind::Conflict);
    }

    #[test]
    fn patch_conflicts_replay_on_latest() {
        let store = seeded();
        let write = RecordWrite::load("c", Key::Int(1), store.clone(), schema(), stats_for(&store), 10, 3).unwrap();
        write.patch(increment()).unwrap();
        let newer = Record::from_json(json!({"id": 1, "count": 5})).unwrap();
        store.compare_and_put(&Key::Int(1), Some(10), Some(Arc::new(newer)), 15).unwrap();
        stage(&write, 20).unwrap();
        let stored = store.get(&Key::Int(1), 20).unwrap().unwrap();
        assert_eq!(stored.record.get("count"), Some(&Value::Int(6)));
    }

    #[test]
    fn put_fills_in_identity_and_rejects_changes() {
        let store = Arc::new(MemoryStore::new());
        let write = RecordWrite::load("c", Key::Int(7), store.clone(), schema(), stats_for(&store), 0, 3).unwrap();
        assert!(write.put(Record::from_json(json!({"id": 8})).unwrap()).is_err());
        write.put(Record::from_json(json!({"name": "x"})).unwrap()).unwrap();
        stage(&write, 5).unwrap();
        let stored = store.get(&Key::Int(7), 5).unwrap().unwrap();
        assert_eq!(stored.record.get("id"), Some(&Value::Int(7)));
    }

    #[test]
    fn deleting_a_missing_record_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let write = RecordWrite::load("c", Key::Int(3), store.clone(), schema(), stats_for(&store), 0, 3).unwrap();
        write.delete().unwrap();
        stage(&write, 5).unwrap();
        assert_eq!(store.latest_version(&Key::Int(3)).unwrap(), None);
    }

    #[test]
    fn rollback_removes_the_applied_version() {
        let store = seeded();
        let write = RecordWrite::load("c", Key::Int(1), store.clone(), schema(), stats_for(&store), 10, 3).unwrap();
        write.patch(increment()).unwrap();
        stage(&write, 20).unwrap();
        assert_eq!(store.latest_version(&Key::Int(1)).unwrap(), Some(20));
        write.rollback(20).unwrap();
        assert_eq!(store.latest_version(&Key::Int(1)).unwrap(), Some(10));
        assert_eq!(write.read_version(), Some(10));
        let stored = store.get(&Key::Int(1), 30).unwrap().unwrap();
        assert_eq!(stored.record.get("count"), Some(&Value::Int(0)));
    }

    #[test]
    fn patching_a_missing_record_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let write = RecordWrite::load("c", Key::Int(3), store.clone(), schema(), stats_for(&store), 0, 3).unwrap();
        assert_eq!(write.patch(increment()).unwrap_err().kind, ErrorKind::NotFound);
    }
}
