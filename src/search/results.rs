use std::sync::Arc;
use tracing::debug;
use crate::core::error::Result;
use crate::core::types::Record;
use crate::search::SearchContext;
use crate::storage::key::Key;

/// One matching record identity, with the record once something loaded it.
#[derive(Debug, Clone)]
pub struct Hit {
    pub key: Key,
    pub record: Option<Arc<Record>>,
}

impl Hit {
    pub fn key(key: Key) -> Self {
        Hit { key, record: None }
    }

    pub fn loaded(key: Key, record: Arc<Record>) -> Self {
        Hit { key, record: Some(record) }
    }

    /// The record, fetched from the snapshot on first use. `None` if it
    /// is not visible there.
    pub fn load(&mut self, ctx: &SearchContext) -> Result<Option<Arc<Record>>> {
        if self.record.is_none() {
            self.record = ctx.fetch(&self.key)?;
        }
        Ok(self.record.clone())
    }
}

/// Lazy sequence of hits.
pub type HitStream = Box<dyn Iterator<Item = Result<Hit>> + Send>;

/// Runs once when a stream finishes, fails, or is dropped.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Records produced by a search, with offset/limit and projection applied.
///
/// The close hook runs exactly once: when the underlying hits run out, when
/// one of them is an error, when the limit is reached, or when the stream
/// is dropped before any of that happens.
pub struct ResultStream {
    hits: HitStream,
    ctx: SearchContext,
    select: Option<Vec<String>>,
    skip: usize,
    remaining: Option<usize>,
    on_close: Option<CloseHook>,
    pub position: usize,
    pub exhausted: bool,
}

impl ResultStream {
    pub fn new(hits: HitStream, ctx: SearchContext, on_close: Option<CloseHook>) -> Self {
        ResultStream {
            hits,
            ctx,
            select: None,
            skip: 0,
            remaining: None,
            on_close,
            position: 0,
            exhausted: false,
        }
    }

    pub fn window(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.skip = offset;
        self.remaining = limit;
        self
    }

    pub fn select(mut self, select: Option<Vec<String>>) -> Self {
        self.select = select;
        self
    }

    /// Stop early and release what the stream holds.
    pub fn close(&mut self) {
        self.exhausted = true;
        if let Some(hook) = self.on_close.take() {
            debug!(collection = %self.ctx.collection, position = self.position, "result stream closed");
            hook();
        }
    }

    /// Drain into a vector; the first error wins.
    pub fn into_records(self) -> Result<Vec<Arc<Record>>> {
        self.collect()
    }
}

impl Iterator for ResultStream {
    type Item = Result<Arc<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if self.remaining == Some(0) {
            self.close();
            return None;
        }
        loop {
            let mut hit = match self.hits.next() {
                None => {
                    self.close();
                    return None;
                }
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(e));
                }
                Some(Ok(hit)) => hit,
            };
            let record = match hit.load(&self.ctx) {
                Ok(Some(record)) => record,
                // removed after the index entry was read
                Ok(None) => continue,
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            };
            // only visible records count towards the offset
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            let record = match &self.select {
                Some(select) => Arc::new(record.project(select)),
                None => record,
            };
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            self.position += 1;
            return Some(Ok(record));
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.close();
    }
}
