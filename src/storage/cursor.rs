use std::collections::VecDeque;
use std::sync::Arc;
use crate::core::error::Result;
use crate::core::types::Timestamp;
use crate::storage::key::Key;
use crate::storage::{Entry, KeyRange, KvStore};

/// Lazy iterator over a primary range. Entries are fetched `batch_size` at a
/// time and the store lock is released between batches, so a long scan
/// never starves writers.
pub struct RangeCursor {
    store: Arc<dyn KvStore>,
    range: KeyRange,
    at: Timestamp,
    batch_size: usize,
    buffer: VecDeque<Entry>,
    last: Option<Key>,
    pub position: usize,
    pub exhausted: bool,
}

impl RangeCursor {
    pub fn new(store: Arc<dyn KvStore>, range: KeyRange, at: Timestamp, batch_size: usize) -> Self {
        RangeCursor {
            store,
            range,
            at,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            last: None,
            position: 0,
            exhausted: false,
        }
    }

    fn fetch_batch(&mut self) -> Result<()> {
        let batch = self.store.scan(&self.range, self.at, self.last.as_ref(), self.batch_size)?;
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(entry) = batch.last() {
            self.last = Some(entry.key.clone());
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for RangeCursor {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_batch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let entry = self.buffer.pop_front()?;
        self.position += 1;
        Some(Ok(entry))
    }
}

/// Lazy iterator over a secondary index range, yielding
/// `(index key, primary key)` pairs.
pub struct IndexCursor {
    store: Arc<dyn KvStore>,
    attribute: String,
    range: KeyRange,
    at: Timestamp,
    batch_size: usize,
    buffer: VecDeque<(Key, Key)>,
    last: Option<(Key, Key)>,
    pub exhausted: bool,
}

impl IndexCursor {
    pub fn new(store: Arc<dyn KvStore>, attribute: &str, range: KeyRange, at: Timestamp, batch_size: usize) -> Self {
        IndexCursor {
            store,
            attribute: attribute.to_string(),
            range,
            at,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            last: None,
            exhausted: false,
        }
    }

    fn fetch_batch(&mut self) -> Result<()> {
        let batch = self.store.scan_index(
            &self.attribute,
            &self.range,
            self.at,
            self.last.as_ref(),
            self.batch_size,
        )?;
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(pair) = batch.last() {
            self.last = Some(pair.clone());
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for IndexCursor {
    type Item = Result<(Key, Key)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_batch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Record;
    use crate::storage::memory::MemoryStore;

    #[test]
    fn cursor_walks_all_batches() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            store.compare_and_put(&Key::Int(i), None, Some(Arc::new(Record::new())), 5).unwrap();
        }
        let cursor = RangeCursor::new(store, KeyRange::all(), 5, 3);
        let keys: Vec<Key> = cursor.map(|e| e.unwrap().key).collect();
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[9], Key::Int(9));
    }

    #[test]
    fn reverse_cursor_walks_descending() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..4 {
            store.compare_and_put(&Key::Int(i), None, Some(Arc::new(Record::new())), 5).unwrap();
        }
        let cursor = RangeCursor::new(store, KeyRange::all().reversed(true), 5, 2);
        let keys: Vec<Key> = cursor.map(|e| e.unwrap().key).collect();
        assert_eq!(keys, vec![Key::Int(3), Key::Int(2), Key::Int(1), Key::Int(0)]);
    }
}
