use std::collections::HashMap;
use crate::storage::key::Key;

type ResourceId = (String, Key);

enum Entries<V> {
    Small(Vec<(ResourceId, V)>),
    Map(HashMap<ResourceId, V>),
}

/// Per-transaction map from (collection, identity) to the one live
/// instance of that record, so repeated lookups inside a transaction see
/// each other's pending edits.
///
/// Starts as a linear list and switches to a hash map once it holds more
/// than `linear_limit` entries.
pub struct ResourceCache<V> {
    entries: Entries<V>,
    linear_limit: usize,
}

impl<V: Clone> ResourceCache<V> {
    pub fn new(linear_limit: usize) -> Self {
        ResourceCache {
            entries: Entries::Small(Vec::new()),
            linear_limit,
        }
    }

    pub fn get(&self, collection: &str, key: &Key) -> Option<V> {
        match &self.entries {
            Entries::Small(list) => list
                .iter()
                .find(|((c, k), _)| c == collection && k == key)
                .map(|(_, v)| v.clone()),
            Entries::Map(map) => map.get(&(collection.to_string(), key.clone())).cloned(),
        }
    }

    pub fn insert(&mut self, collection: &str, key: Key, value: V) {
        let id = (collection.to_string(), key);
        match &mut self.entries {
            Entries::Small(list) => {
                if let Some(slot) = list.iter_mut().find(|(existing, _)| *existing == id) {
                    slot.1 = value;
                    return;
                }
                list.push((id, value));
                if list.len() > self.linear_limit {
                    let map = std::mem::take(list).into_iter().collect();
                    self.entries = Entries::Map(map);
                }
            }
            Entries::Map(map) => {
                map.insert(id, value);
            }
        }
    }

    /// Cached instance, or the one `load` produces, which is then cached.
    pub fn get_or_try_insert<E>(
        &mut self,
        collection: &str,
        key: &Key,
        load: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(existing) = self.get(collection, key) {
            return Ok(existing);
        }
        let value = load()?;
        self.insert(collection, key.clone(), value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Small(list) => list.len(),
            Entries::Map(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_hashed(&self) -> bool {
        matches!(self.entries, Entries::Map(_))
    }

    pub fn clear(&mut self) {
        self.entries = Entries::Small(Vec::new());
    }
}
