pub mod results;
pub mod index_range;
pub mod adaptive;
pub mod join;
pub mod executor;

use std::sync::Arc;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::CollectionStats;
use crate::core::types::{Record, Timestamp};
use crate::schema::schema::{Attribute, Relationship, Schema};
use crate::storage::KvStore;
use crate::storage::cursor::{IndexCursor, RangeCursor};
use crate::storage::key::Key;
use crate::storage::KeyRange;

/// Looks up the collections a relationship attribute points at.
pub trait RelationResolver: Send + Sync {
    /// Search context for `collection`, reading at the same snapshot and
    /// under the same full-scan policy as `parent`.
    fn context_for(&self, collection: &str, parent: &SearchContext) -> Result<SearchContext>;
}

/// Availability of an index for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// The attribute is the identity; the primary store is its index.
    Primary,
    Ready,
    Building,
    Missing,
}

/// Everything a search over one collection needs, bound to one snapshot.
#[derive(Clone)]
pub struct SearchContext {
    pub collection: String,
    pub store: Arc<dyn KvStore>,
    pub schema: Arc<Schema>,
    pub stats: Arc<CollectionStats>,
    pub config: Arc<Config>,
    pub at: Timestamp,
    pub allow_full_scan: bool,
    pub relations: Option<Arc<dyn RelationResolver>>,
}

impl SearchContext {
    pub fn index_state(&self, attribute: &str) -> IndexState {
        if self.schema.is_primary_key(attribute) {
            IndexState::Primary
        } else if !self.store.has_index(attribute) {
            IndexState::Missing
        } else if self.store.is_index_building(attribute) {
            IndexState::Building
        } else {
            IndexState::Ready
        }
    }

    /// Attribute definition with a relationship, or a client error naming it.
    pub fn relationship(&self, name: &str) -> Result<(&Attribute, &Relationship)> {
        let attribute = self.schema.attribute(name).ok_or_else(|| {
            Error::client(format!("{} has no attribute {} to traverse", self.collection, name))
        })?;
        let relationship = attribute.relationship.as_ref().ok_or_else(|| {
            Error::client(format!(
                "{}.{} is not a relationship; relational queries need one",
                self.collection, name
            ))
        })?;
        Ok((attribute, relationship))
    }

    pub fn related(&self, collection: &str) -> Result<SearchContext> {
        let relations = self.relations.as_ref().ok_or_else(|| {
            Error::client(format!("{} cannot resolve relationships to {}", self.collection, collection))
        })?;
        relations.context_for(collection, self)
    }

    pub fn is_multi_valued(&self, attribute: &str) -> bool {
        self.schema.attribute(attribute).is_some_and(|a| a.is_multi_valued())
    }

    pub fn fetch(&self, key: &Key) -> Result<Option<Arc<Record>>> {
        Ok(self.store.get(key, self.at)?.map(|entry| entry.record))
    }

    pub fn range_cursor(&self, range: KeyRange) -> RangeCursor {
        RangeCursor::new(self.store.clone(), range, self.at, self.config.scan_batch_size)
    }

    pub fn index_cursor(&self, attribute: &str, range: KeyRange) -> IndexCursor {
        IndexCursor::new(self.store.clone(), attribute, range, self.at, self.config.scan_batch_size)
    }
}
