use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use tracing::info;
use crate::core::collection::Collection;
use crate::core::config::Config;
use crate::core::context::RequestContext;
use crate::core::error::{Error, Result};
use crate::core::transaction::{self, CommitResult};
use crate::mvcc::controller::MVCCController;
use crate::schema::schema::Schema;
use crate::search::{RelationResolver, SearchContext};
use crate::storage::KvStore;
use crate::storage::memory::MemoryStore;

/// Named collections; resolves relationship targets for searches.
#[derive(Default)]
pub struct Catalog {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No collection named {}", name)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl RelationResolver for Catalog {
    fn context_for(&self, collection: &str, parent: &SearchContext) -> Result<SearchContext> {
        let collection = self.get(collection).map_err(|_| {
            Error::client(format!(
                "{} references collection {}, which does not exist",
                parent.collection, collection
            ))
        })?;
        Ok(collection.search_context(parent.at, parent.allow_full_scan))
    }
}

pub struct Database {
    config: Arc<Config>,

    mvcc: Arc<MVCCController>,   // timestamps + read views, shared by every collection
    catalog: Arc<Catalog>,
}

impl Database {
    pub fn new(config: Config) -> Self {
        Database {
            config: Arc::new(config),
            mvcc: Arc::new(MVCCController::new()),
            catalog: Arc::new(Catalog::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mvcc(&self) -> &Arc<MVCCController> {
        &self.mvcc
    }

    /// New collection backed by an in-memory store.
    pub fn create_collection(&self, name: &str, schema: Schema) -> Result<Arc<Collection>> {
        self.create_collection_with_store(name, schema, Arc::new(MemoryStore::new()))
    }

    pub fn create_collection_with_store(
        &self,
        name: &str,
        schema: Schema,
        store: Arc<dyn KvStore>,
    ) -> Result<Arc<Collection>> {
        let mut collections = self.catalog.collections.write();
        if collections.contains_key(name) {
            return Err(Error::client(format!("Collection {} already exists", name)));
        }
        let collection = Arc::new(Collection::open(
            name,
            schema,
            store,
            self.mvcc.clone(),
            self.config.clone(),
            Arc::downgrade(&self.catalog),
        )?);
        collections.insert(name.to_string(), collection.clone());
        info!(collection = name, "collection created");
        Ok(collection)
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.catalog.get(name)
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Run `body` in a Transaction Set, or inside the one `ctx` already
    /// carries. Returns the commit result when this call committed.
    pub fn transaction<T>(
        &self,
        ctx: &mut RequestContext,
        body: impl FnOnce(&mut RequestContext) -> Result<T>,
    ) -> Result<(T, Option<CommitResult>)> {
        transaction::transaction(&self.mvcc, &self.config, ctx, body)
    }

    /// Vacuum every collection up to the oldest active read view.
    pub fn vacuum(&self) -> Result<usize> {
        let horizon = self.mvcc.vacuum_horizon();
        let collections: Vec<Arc<Collection>> = self.catalog.collections.read().values().cloned().collect();
        let mut removed = 0;
        for collection in collections {
            removed += collection.vacuum(horizon)?;
        }
        info!(horizon, removed, "vacuum finished");
        Ok(removed)
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new(Config::default())
    }
}
