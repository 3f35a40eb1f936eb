use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::query::compiler::foreign_keys;
use crate::query::condition::{Comparator, Leaf};
use crate::search::index_range::search_by_index;
use crate::search::results::{Hit, HitStream};
use crate::search::{IndexState, SearchContext};
use crate::storage::key::Key;
use crate::storage::KeyRange;

/// Turns hits on a related collection into hits on `left`.
pub struct JoinResolver {
    left: SearchContext,
}

impl JoinResolver {
    pub fn new(left: SearchContext) -> Self {
        JoinResolver { left }
    }

    /// `left` holds the foreign key in `local_attribute`. Yields left records
    /// whose key (or any key of a key array) is among the right hits.
    pub fn join_from(&self, local_attribute: &str, right: HitStream) -> Result<HitStream> {
        let ids = right.map(|hit| hit.map(|h| h.key)).collect::<Result<HashSet<Key>>>()?;
        debug!(collection = %self.left.collection, attribute = local_attribute, ids = ids.len(), "join from");
        match self.left.index_state(local_attribute) {
            IndexState::Missing => self.scan_for(local_attribute, ids),
            IndexState::Building => Err(Error::unavailable(format!(
                "Index on {}.{} is still building",
                self.left.collection, local_attribute
            ))),
            IndexState::Primary | IndexState::Ready => {
                let mut ids: Vec<Key> = ids.into_iter().collect();
                ids.sort();
                let ctx = self.left.clone();
                let attribute = local_attribute.to_string();
                let mut seen = HashSet::new();
                let hits = ids
                    .into_iter()
                    .flat_map(move |id| {
                        let leaf = Leaf::new(vec![attribute.clone()], Comparator::Equals, Some(id.to_value()));
                        match search_by_index(&leaf, &ctx, false) {
                            Ok(hits) => hits,
                            Err(e) => Box::new(std::iter::once(Err(e))) as HitStream,
                        }
                    })
                    .filter(move |hit| match hit {
                        // one left record can reference several right ids
                        Ok(hit) => seen.insert(hit.key.clone()),
                        Err(_) => true,
                    });
                Ok(Box::new(hits))
            }
        }
    }

    fn scan_for(&self, local_attribute: &str, ids: HashSet<Key>) -> Result<HitStream> {
        if !self.left.allow_full_scan {
            return Err(Error::client(format!(
                "{}.{} is not indexed and full scans are not allowed",
                self.left.collection, local_attribute
            )));
        }
        debug!(collection = %self.left.collection, attribute = local_attribute, "full-scan fallback for join");
        let attribute = local_attribute.to_string();
        let hits = self.left.range_cursor(KeyRange::all()).filter_map(move |entry| match entry {
            Ok(entry) => foreign_keys(entry.record.get(&attribute))
                .iter()
                .any(|key| ids.contains(key))
                .then(|| Ok(Hit::loaded(entry.key, entry.record))),
            Err(e) => Some(Err(e)),
        });
        Ok(Box::new(hits))
    }

    /// The related collection (`right_ctx`) holds our key in
    /// `foreign_attribute`. The right side has to be read completely before
    /// the first left key is known, so it is materialized into a map from
    /// left key to the right keys referencing it; left keys come out in
    /// key order.
    pub fn join_to(
        &self,
        right_ctx: &SearchContext,
        foreign_attribute: &str,
        many_to_many: bool,
        right: HitStream,
    ) -> Result<HitStream> {
        let mut referenced: BTreeMap<Key, Vec<Key>> = BTreeMap::new();
        for hit in right {
            let mut hit = hit?;
            let Some(record) = hit.load(right_ctx)? else {
                continue;
            };
            let value = record.get(foreign_attribute);
            let keys = if many_to_many {
                foreign_keys(value)
            } else {
                value
                    .and_then(Key::from_value)
                    .filter(|k| *k != Key::Null)
                    .into_iter()
                    .collect()
            };
            for key in keys {
                referenced.entry(key).or_default().push(hit.key.clone());
            }
        }
        debug!(
            collection = %self.left.collection,
            related = %right_ctx.collection,
            attribute = foreign_attribute,
            left = referenced.len(),
            "join to"
        );
        let left = self.left.clone();
        let hits = referenced.into_keys().filter_map(move |key| match left.fetch(&key) {
            Ok(Some(record)) => Some(Ok(Hit::loaded(key, record))),
            // foreign key pointing at a record that does not exist
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        });
        Ok(Box::new(hits))
    }
}
