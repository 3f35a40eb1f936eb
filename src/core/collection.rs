use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::core::config::Config;
use crate::core::context::{Permission, RequestContext};
use crate::core::database::Catalog;
use crate::core::error::{Error, Result};
use crate::core::stats::CollectionStats;
use crate::core::transaction::{transaction, TransactionSet};
use crate::core::types::{Record, Timestamp};
use crate::mvcc::controller::MVCCController;
use crate::query::planner::{Plan, QueryPlanner};
use crate::query::types::SearchRequest;
use crate::record::tracked::TrackedRecord;
use crate::schema::schema::Schema;
use crate::search::executor::ConditionExecutor;
use crate::search::results::{CloseHook, ResultStream};
use crate::search::{RelationResolver, SearchContext};
use crate::storage::key::Key;
use crate::storage::{IndexDefinition, KvStore};
use crate::writer::record_write::{Patch, RecordWrite};

/// A named set of records sharing one schema, store and statistics handle.
pub struct Collection {
    name: String,
    schema: Arc<Schema>,
    store: Arc<dyn KvStore>,
    stats: Arc<CollectionStats>,
    mvcc: Arc<MVCCController>,
    config: Arc<Config>,
    catalog: Weak<Catalog>,
}

impl Collection {
    /// Wrap `store` and build every index the schema declares.
    pub(crate) fn open(
        name: &str,
        schema: Schema,
        store: Arc<dyn KvStore>,
        mvcc: Arc<MVCCController>,
        config: Arc<Config>,
        catalog: Weak<Catalog>,
    ) -> Result<Self> {
        let collection = Collection {
            name: name.to_string(),
            stats: Arc::new(CollectionStats::new(store.clone(), &config)),
            schema: Arc::new(schema),
            store,
            mvcc,
            config,
            catalog,
        };
        let indexed: Vec<String> = collection.schema.indexed_attributes().map(|a| a.name.clone()).collect();
        for attribute in indexed {
            collection.create_index(&attribute)?;
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<CollectionStats> {
        &self.stats
    }

    /// Everything a search over this collection needs, reading at `at`.
    pub fn search_context(&self, at: Timestamp, allow_full_scan: bool) -> SearchContext {
        SearchContext {
            collection: self.name.clone(),
            store: self.store.clone(),
            schema: self.schema.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
            at,
            allow_full_scan,
            relations: self.catalog.upgrade().map(|c| c as Arc<dyn RelationResolver>),
        }
    }

    /// The plan `search` would run for `request` right now.
    pub fn explain(&self, request: SearchRequest) -> Result<Plan> {
        let request = request.normalized()?;
        let allow = request.allow_full_scan.unwrap_or(self.config.allow_full_scan);
        let ctx = self.search_context(self.mvcc.last_committed(), allow);
        QueryPlanner::plan(&ctx, &request)
    }

    /// Lazy search. Inside a transaction the stream reads the set's
    /// snapshot, which stays pinned until the set finishes; the last open
    /// stream to close calls `done_reading`. Outside one the stream pins its
    /// own read view until it closes.
    pub fn search(&self, ctx: &RequestContext, request: SearchRequest) -> Result<ResultStream> {
        ctx.check(Permission::Read)?;
        let request = request.normalized()?;
        let allow = request.allow_full_scan.unwrap_or(self.config.allow_full_scan);
        let (at, on_close): (Timestamp, CloseHook) = match ctx.transaction() {
            Some(set) => {
                let set = set.clone();
                set.stream_opened();
                (set.read_timestamp(), Box::new(move || set.stream_closed()))
            }
            None => {
                let view = self.mvcc.begin_read();
                let mvcc = self.mvcc.clone();
                (view.timestamp, Box::new(move || mvcc.release_read(&view)))
            }
        };
        let search_ctx = self.search_context(at, allow);
        let hits = QueryPlanner::plan(&search_ctx, &request).and_then(|plan| {
            debug!(collection = %self.name, at, plan = ?plan, "search planned");
            ConditionExecutor::new(search_ctx.clone()).run(&plan)
        });
        let hits = match hits {
            Ok(hits) => hits,
            Err(e) => {
                on_close();
                return Err(e);
            }
        };
        let select = ctx.narrow_select(request.select.as_deref());
        Ok(ResultStream::new(hits, search_ctx, Some(on_close))
            .window(request.offset, request.limit)
            .select(select))
    }

    /// Point read. Inside a transaction it sees the set's pending edits.
    pub fn get(&self, ctx: &RequestContext, key: &Key) -> Result<Option<Arc<Record>>> {
        ctx.check(Permission::Read)?;
        match ctx.transaction() {
            Some(set) => Ok(self.record_write(set, key)?.current().map(Arc::new)),
            None => {
                let view = self.mvcc.begin_read();
                let entry = self.store.get(key, view.timestamp);
                self.mvcc.release_read(&view);
                Ok(entry?.map(|e| e.record))
            }
        }
    }

    /// Tracked handle for in-place edits, written when the surrounding
    /// transaction commits. `None` when the record does not exist.
    pub fn get_for_update(&self, ctx: &RequestContext, key: &Key) -> Result<Option<Arc<Mutex<TrackedRecord>>>> {
        ctx.check(Permission::Write)?;
        let set = ctx.transaction().ok_or_else(|| {
            Error::invalid_state(format!("get_for_update on {} needs an open transaction", self.name))
        })?;
        Ok(self.writable(set, key)?.handle())
    }

    /// Insert or replace a record; returns its key, generating one when the
    /// record has none. Conflicting concurrent writes abort the transaction.
    pub fn put(&self, ctx: &mut RequestContext, record: Record) -> Result<Key> {
        ctx.check(Permission::Write)?;
        let key = match record.get(&self.schema.primary_key).and_then(Key::from_value) {
            Some(key) if key != Key::Null => key,
            _ => Key::Str(Uuid::new_v4().to_string()),
        };
        transaction(&self.mvcc, &self.config, ctx, |ctx| {
            let set = self.open_set(ctx)?;
            self.writable(&set, &key)?.put(record)
        })?;
        Ok(key)
    }

    /// Remove a record; returns whether it existed.
    pub fn delete(&self, ctx: &mut RequestContext, key: &Key) -> Result<bool> {
        ctx.check(Permission::Delete)?;
        let (existed, _) = transaction(&self.mvcc, &self.config, ctx, |ctx| {
            let set = self.open_set(ctx)?;
            let write = self.writable(&set, key)?;
            let existed = write.current().is_some();
            write.delete()?;
            Ok(existed)
        })?;
        Ok(existed)
    }

    /// Apply `patch` to an existing record. If the record changes before
    /// commit, the patch is replayed on the newer version instead of failing.
    pub fn update<F>(&self, ctx: &mut RequestContext, key: &Key, patch: F) -> Result<()>
    where
        F: Fn(&mut TrackedRecord) -> Result<()> + Send + Sync + 'static,
    {
        ctx.check(Permission::Write)?;
        let patch: Patch = Arc::new(patch);
        transaction(&self.mvcc, &self.config, ctx, |ctx| {
            let set = self.open_set(ctx)?;
            self.writable(&set, key)?.patch(patch)
        })?;
        Ok(())
    }

    fn open_set(&self, ctx: &RequestContext) -> Result<Arc<TransactionSet>> {
        ctx.transaction()
            .cloned()
            .ok_or_else(|| Error::internal("mutation outside a transaction"))
    }

    /// The set's one sub-transaction for `key` in this collection.
    fn record_write(&self, set: &TransactionSet, key: &Key) -> Result<Arc<RecordWrite>> {
        set.resources().get_or_try_insert(&self.name, key, || {
            RecordWrite::load(
                &self.name,
                key.clone(),
                self.store.clone(),
                self.schema.clone(),
                self.stats.clone(),
                set.read_timestamp(),
                self.config.max_commit_retries,
            )
        })
    }

    fn writable(&self, set: &TransactionSet, key: &Key) -> Result<Arc<RecordWrite>> {
        let write = self.record_write(set, key)?;
        if write.claim_registration() {
            set.register(write.clone())?;
        }
        Ok(write)
    }

    fn index_definition(&self, attribute: &str) -> IndexDefinition {
        let declared = self.schema.attribute(attribute);
        IndexDefinition {
            attribute: attribute.to_string(),
            multi_valued: declared.is_some_and(|a| a.is_multi_valued()),
            index_nulls: declared.is_none_or(|a| a.index_nulls),
            max_key_bytes: self.config.max_key_bytes,
        }
    }

    /// Define and populate a secondary index before returning.
    pub fn create_index(&self, attribute: &str) -> Result<()> {
        if self.schema.is_primary_key(attribute) {
            return Ok(());
        }
        self.store.define_index(self.index_definition(attribute))?;
        self.store.populate_index(attribute)?;
        self.stats.invalidate();
        Ok(())
    }

    /// Define the index now and populate it on the rayon pool. Until the
    /// job finishes, searches needing the index fail as unavailable.
    pub fn create_index_in_background(self: &Arc<Self>, attribute: &str) -> Result<()> {
        if self.schema.is_primary_key(attribute) {
            return Ok(());
        }
        self.store.define_index(self.index_definition(attribute))?;
        info!(collection = %self.name, attribute, "background index build started");
        let collection = Arc::clone(self);
        let attribute = attribute.to_string();
        rayon::spawn(move || match collection.store.populate_index(&attribute) {
            Ok(()) => {
                collection.stats.invalidate();
                info!(collection = %collection.name, attribute = %attribute, "background index build finished");
            }
            Err(e) => {
                warn!(collection = %collection.name, attribute = %attribute, error = %e, "background index build failed");
            }
        });
        Ok(())
    }

    /// Drop versions older than `horizon` that no reader can see.
    pub fn vacuum(&self, horizon: Timestamp) -> Result<usize> {
        let removed = self.store.vacuum(horizon)?;
        if removed > 0 {
            self.stats.invalidate();
        }
        Ok(removed)
    }
}
