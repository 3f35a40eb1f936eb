use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use crate::core::config::Config;
use crate::core::context::RequestContext;
use crate::core::error::{Error, Result};
use crate::core::resource_cache::ResourceCache;
use crate::core::types::Timestamp;
use crate::mvcc::controller::{MVCCController, ReadView};
use crate::writer::record_write::RecordWrite;

/// Transaction ID generator
static TRANSACTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a Transaction Set (and of each sub-transaction in it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accumulating sub-transactions.
    Active,
    /// Commit timestamp assigned, sub-transactions being applied.
    Preparing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// One unit of work registered with a Transaction Set, usually the pending
/// write of a single record.
pub trait SubTransaction: Send + Sync {
    /// Short label for log events.
    fn describe(&self) -> String;

    /// Optimistic check that the preconditions captured at read time still
    /// hold. Runs under the commit lock.
    fn validate(&self) -> Result<()>;

    /// Stage the write for `timestamp`. May register further
    /// sub-transactions on `set`; commit keeps looping until none appear.
    fn prepare(&self, timestamp: Timestamp, set: &TransactionSet) -> Result<()>;

    /// Make the staged write visible. Only called once every entry of the
    /// set validated and prepared.
    fn apply(&self, timestamp: Timestamp) -> Result<()>;

    /// Undo a successful `apply` at `timestamp`. Called, in reverse apply
    /// order, when a later entry of the same set fails to apply.
    fn rollback(&self, _timestamp: Timestamp) -> Result<()> {
        Ok(())
    }

    /// Release everything; nothing staged may become visible afterwards.
    fn abort(&self);

    /// Release read-only resources once result iteration is finished.
    fn done_reading(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_timestamp: Timestamp,
}

/// Everything opened during one logical request; commits atomically with
/// a single timestamp or not at all.
pub struct TransactionSet {
    pub id: u64,
    mvcc: Arc<MVCCController>,
    view: ReadView,
    entries: Mutex<Vec<Arc<dyn SubTransaction>>>,
    timestamp: Mutex<Option<Timestamp>>,
    state: RwLock<TransactionState>,
    resources: Mutex<ResourceCache<Arc<RecordWrite>>>,
    open_streams: AtomicUsize,
    view_released: AtomicBool,
}

impl TransactionSet {
    /// Open a set and pin a read view at the current committed watermark.
    pub fn begin(mvcc: Arc<MVCCController>, config: &Config) -> Self {
        let id = TRANSACTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let view = mvcc.begin_read();
        debug!(transaction = id, read_timestamp = view.timestamp, "transaction opened");
        TransactionSet {
            id,
            mvcc,
            view,
            entries: Mutex::new(Vec::new()),
            timestamp: Mutex::new(None),
            state: RwLock::new(TransactionState::Active),
            resources: Mutex::new(ResourceCache::new(config.resource_cache_linear_limit)),
            open_streams: AtomicUsize::new(0),
            view_released: AtomicBool::new(false),
        }
    }

    /// Snapshot every read inside this set observes.
    pub fn read_timestamp(&self) -> Timestamp {
        self.view.timestamp
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    /// Commit timestamp, once the first commit attempt assigned it.
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        *self.timestamp.lock()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn resources(&self) -> MutexGuard<'_, ResourceCache<Arc<RecordWrite>>> {
        self.resources.lock()
    }

    /// Add a sub-transaction. Allowed while open and while committing, so
    /// a commit can cascade into further writes.
    pub fn register(&self, entry: Arc<dyn SubTransaction>) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::invalid_state(format!(
                "transaction {} is {:?}, cannot register {}",
                self.id,
                state,
                entry.describe()
            )));
        }
        self.entries.lock().push(entry);
        Ok(())
    }

    fn assign_timestamp(&self) -> Timestamp {
        *self
            .timestamp
            .lock()
            .get_or_insert_with(|| self.mvcc.next_timestamp())
    }

    /// Validate, stamp and apply every registered sub-transaction. Any
    /// failure aborts the whole set and is returned unchanged.
    pub fn commit(&self) -> Result<CommitResult> {
        {
            let mut state = self.state.write();
            if *state != TransactionState::Active {
                return Err(Error::invalid_state(format!(
                    "transaction {} is {:?}, cannot commit",
                    self.id, *state
                )));
            }
            *state = TransactionState::Preparing;
        }
        match self.commit_entries() {
            Ok(result) => {
                *self.state.write() = TransactionState::Committed;
                self.done_reading();
                self.release_view();
                Ok(result)
            }
            Err(e) => {
                warn!(transaction = self.id, error = %e, "commit failed, aborting");
                self.abort();
                Err(e)
            }
        }
    }

    fn commit_entries(&self) -> Result<CommitResult> {
        let _guard = self.mvcc.commit_guard();
        let mut prepared = 0;
        let mut rounds = 0;
        loop {
            let pending: Vec<_> = self.entries.lock()[prepared..].to_vec();
            if pending.is_empty() {
                break;
            }
            if rounds > 0 {
                debug!(transaction = self.id, added = pending.len(), "commit picked up cascaded entries");
            }
            for entry in &pending {
                entry.validate()?;
            }
            let ts = self.assign_timestamp();
            for entry in &pending {
                entry.prepare(ts, self)?;
            }
            prepared += pending.len();
            rounds += 1;
        }
        let ts = self.assign_timestamp();
        let entries = self.entries.lock().clone();
        for (applied, entry) in entries.iter().enumerate() {
            if let Err(e) = entry.apply(ts) {
                self.roll_back(&entries[..applied], ts);
                return Err(e);
            }
        }
        self.mvcc.mark_committed(ts);
        info!(transaction = self.id, timestamp = ts, entries = entries.len(), "transaction committed");
        Ok(CommitResult { commit_timestamp: ts })
    }

    /// Undo the entries that already applied at `ts`. The watermark never
    /// reached `ts`, so no reader saw them.
    fn roll_back(&self, applied: &[Arc<dyn SubTransaction>], ts: Timestamp) {
        for entry in applied.iter().rev() {
            if let Err(e) = entry.rollback(ts) {
                warn!(transaction = self.id, entry = %entry.describe(), error = %e, "rollback failed");
            }
        }
        warn!(transaction = self.id, timestamp = ts, rolled_back = applied.len(), "partial apply rolled back");
    }

    /// Ask every sub-transaction to release its resources. Idempotent;
    /// a committed set is left alone.
    pub fn abort(&self) {
        {
            let mut state = self.state.write();
            if *state == TransactionState::Committed || *state == TransactionState::Aborted {
                return;
            }
            *state = TransactionState::Aborted;
        }
        let entries = self.entries.lock().clone();
        for entry in &entries {
            entry.abort();
        }
        self.resources.lock().clear();
        info!(transaction = self.id, entries = entries.len(), "transaction aborted");
        self.done_reading();
        self.release_view();
    }

    /// Release the read-only resources of the sub-transactions. The pinned
    /// read view stays until the set commits or aborts, so later reads in
    /// the set still find their snapshot.
    pub fn done_reading(&self) {
        let entries = self.entries.lock().clone();
        for entry in &entries {
            entry.done_reading();
        }
    }

    /// A result stream reading this set's snapshot was opened.
    pub(crate) fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
    }

    /// A result stream closed; the last one to close ends result iteration.
    pub(crate) fn stream_closed(&self) {
        if self.open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done_reading();
        }
    }

    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn release_view(&self) {
        if !self.view_released.swap(true, Ordering::SeqCst) {
            self.mvcc.release_read(&self.view);
        }
    }
}

impl Drop for TransactionSet {
    fn drop(&mut self) {
        self.release_view();
    }
}

/// Run `body` inside a Transaction Set.
///
/// If `ctx` already carries an open set the body joins it and no commit
/// happens here (the result is `None`). Otherwise a new set is opened,
/// attached to `ctx` for the duration of the body, and committed when the
/// body succeeds; a failing body aborts it and its error is returned.
pub fn transaction<T>(
    mvcc: &Arc<MVCCController>,
    config: &Config,
    ctx: &mut RequestContext,
    body: impl FnOnce(&mut RequestContext) -> Result<T>,
) -> Result<(T, Option<CommitResult>)> {
    if ctx.transaction.is_some() {
        return body(ctx).map(|value| (value, None));
    }
    let set = Arc::new(TransactionSet::begin(mvcc.clone(), config));
    ctx.transaction = Some(set.clone());
    let outcome = body(ctx);
    ctx.transaction = None;
    match outcome {
        Ok(value) => {
            let result = set.commit()?;
            Ok((value, Some(result)))
        }
        Err(e) => {
            debug!(transaction = set.id, error = %e, "transaction body failed");
            set.abort();
            Err(e)
        }
    }
}
