use std::collections::HashSet;
use std::ops::Bound;
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use crate::query::compiler::{compile_leaf, prefix_key, Predicate};
use crate::query::condition::{Comparator, Leaf};
use crate::search::results::{Hit, HitStream};
use crate::search::{IndexState, SearchContext};
use crate::storage::cursor::IndexCursor;
use crate::storage::key::{prefix_successor, Key, OVERFLOW_MARKER};
use crate::storage::KeyRange;

/// Key range answering one leaf, and whether hits must be confirmed
/// against the stored record because a bound did not fit in an index key.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    pub range: KeyRange,
    pub recheck: bool,
}

impl RangeSpec {
    /// `max_key_bytes` is `None` for the primary store, whose keys are
    /// never truncated.
    pub fn for_leaf(leaf: &Leaf, max_key_bytes: Option<usize>) -> Result<RangeSpec> {
        let bounds = Bounds { max: max_key_bytes };
        let mut recheck = false;
        let range = match leaf.comparator {
            Comparator::Sort => KeyRange::all(),
            Comparator::Equals => {
                let key = operand(leaf, leaf.value()?)?;
                match bounds.floor(&key) {
                    Some(floor) => {
                        recheck = true;
                        KeyRange::new(Bound::Included(floor), Bound::Included(bounds.ceiling(&key)))
                    }
                    None => KeyRange::exact(key),
                }
            }
            Comparator::NotEqual => match leaf.value()? {
                Value::Null => KeyRange::new(Bound::Excluded(Key::Null), Bound::Unbounded),
                _ => return Err(full_scan_required(leaf)),
            },
            Comparator::GreaterThan | Comparator::GreaterThanEqual => {
                let key = operand(leaf, leaf.value()?)?;
                let start = match bounds.floor(&key) {
                    Some(floor) => {
                        recheck = true;
                        Bound::Included(floor)
                    }
                    None if key == Key::Null || leaf.comparator == Comparator::GreaterThan => Bound::Excluded(key),
                    None => Bound::Included(key),
                };
                KeyRange::new(start, Bound::Unbounded)
            }
            Comparator::LessThan | Comparator::LessThanEqual => {
                let key = operand(leaf, leaf.value()?)?;
                let end = if bounds.floor(&key).is_some() {
                    recheck = true;
                    Bound::Included(bounds.ceiling(&key))
                } else if leaf.comparator == Comparator::LessThan {
                    Bound::Excluded(key)
                } else {
                    Bound::Included(key)
                };
                KeyRange::new(Bound::Excluded(Key::Null), end)
            }
            Comparator::Between => {
                let (low, high) = leaf.bounds()?;
                let (low, high) = (operand(leaf, low)?, operand(leaf, high)?);
                let start = match bounds.floor(&low) {
                    Some(floor) => {
                        recheck = true;
                        Bound::Included(floor)
                    }
                    None if low == Key::Null => Bound::Excluded(Key::Null),
                    None => Bound::Included(low),
                };
                if bounds.floor(&high).is_some() {
                    recheck = true;
                }
                KeyRange::new(start, Bound::Included(bounds.ceiling(&high)))
            }
            Comparator::StartsWith => {
                let prefix = leaf
                    .value()?
                    .as_str()
                    .ok_or_else(|| Error::client(format!("starts_with on {} needs a string", leaf.name())))?;
                let key = Key::Str(prefix.to_string());
                match bounds.floor(&key) {
                    Some(floor) => {
                        recheck = true;
                        KeyRange::new(Bound::Included(floor), Bound::Included(bounds.ceiling(&key)))
                    }
                    None => {
                        // every string sorts before the first byte string
                        let end = prefix_successor(prefix)
                            .map(|s| Bound::Excluded(Key::Str(s)))
                            .unwrap_or(Bound::Excluded(Key::Bytes(Vec::new())));
                        KeyRange::new(Bound::Included(key), end)
                    }
                }
            }
            Comparator::Prefix => {
                let key = prefix_key(operand(leaf, leaf.value()?)?);
                let head = match bounds.floor(&key) {
                    Some(floor) => {
                        recheck = true;
                        floor
                    }
                    None => key,
                };
                let Key::Tuple(parts) = head else {
                    return Err(Error::internal("prefix bound is not a tuple"));
                };
                let mut upper = parts.clone();
                upper.push(Key::Max);
                KeyRange::new(Bound::Included(Key::Tuple(parts)), Bound::Included(Key::Tuple(upper)))
            }
            Comparator::Contains | Comparator::EndsWith => return Err(full_scan_required(leaf)),
        };
        Ok(RangeSpec { range, recheck })
    }
}

fn operand(leaf: &Leaf, value: &Value) -> Result<Key> {
    Key::from_value(value).ok_or_else(|| {
        Error::client(format!("{} cannot be compared with {}", leaf.name(), value.type_name()))
    })
}

fn full_scan_required(leaf: &Leaf) -> Error {
    Error::client(format!(
        "{:?} on {} cannot use an index and needs a full scan",
        leaf.comparator,
        leaf.name()
    ))
}

/// Range bounds for keys that may not fit in an index entry.
struct Bounds {
    max: Option<usize>,
}

impl Bounds {
    fn string_cut(&self, s: &str) -> Option<usize> {
        let budget = self.max?.saturating_sub(OVERFLOW_MARKER.len_utf8());
        if s.len() <= budget {
            return None;
        }
        let mut cut = budget;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        Some(cut)
    }

    fn bytes_cut(&self, b: &[u8]) -> Option<usize> {
        let budget = self.max?.saturating_sub(1);
        (b.len() > budget).then_some(budget)
    }

    /// A key at or below every index key a value matching `key` can have,
    /// or `None` when `key` is stored as is.
    fn floor(&self, key: &Key) -> Option<Key> {
        match key {
            Key::Str(s) => self.string_cut(s).map(|cut| Key::Str(s[..cut].to_string())),
            Key::Bytes(b) => self.bytes_cut(b).map(|cut| Key::Bytes(b[..cut].to_vec())),
            Key::Tuple(parts) => {
                let long = parts.iter().position(|p| self.floor(p).is_some())?;
                Some(Key::Tuple(parts[..long].to_vec()))
            }
            _ => None,
        }
    }

    /// Counterpart of `floor`: at or above every such index key.
    fn ceiling(&self, key: &Key) -> Key {
        match key {
            Key::Str(s) => match self.string_cut(s) {
                Some(cut) => {
                    let mut ceiling = s[..cut].to_string();
                    ceiling.push(OVERFLOW_MARKER);
                    Key::Str(ceiling)
                }
                None => key.clone(),
            },
            Key::Bytes(b) => match self.bytes_cut(b) {
                Some(cut) => {
                    let mut ceiling = b[..cut].to_vec();
                    ceiling.push(0xFF);
                    Key::Bytes(ceiling)
                }
                None => key.clone(),
            },
            Key::Tuple(parts) => match parts.iter().position(|p| self.floor(p).is_some()) {
                Some(long) => {
                    let mut ceiling = parts[..long].to_vec();
                    ceiling.push(Key::Max);
                    Key::Tuple(ceiling)
                }
                None => key.clone(),
            },
            _ => key.clone(),
        }
    }
}

/// Ordered hits for one leaf from the primary store or the leaf's
/// secondary index. Ascending unless `reverse`.
pub fn search_by_index(leaf: &Leaf, ctx: &SearchContext, reverse: bool) -> Result<HitStream> {
    if leaf.is_path() {
        return Err(Error::client(format!(
            "{} traverses a relationship and has no index of its own",
            leaf.attribute.join(".")
        )));
    }
    let name = leaf.name();
    match ctx.index_state(name) {
        IndexState::Missing => Err(Error::client(format!("{}.{} is not indexed", ctx.collection, name))),
        IndexState::Building => Err(Error::unavailable(format!(
            "Index on {}.{} is still building",
            ctx.collection, name
        ))),
        IndexState::Primary => {
            let spec = RangeSpec::for_leaf(leaf, None)?;
            let cursor = ctx.range_cursor(spec.range.reversed(reverse));
            Ok(Box::new(cursor.map(|entry| entry.map(|e| Hit::loaded(e.key, e.record)))))
        }
        IndexState::Ready => {
            if leaf.comparator == Comparator::Equals
                && leaf.value()?.is_null()
                && !ctx.schema.attribute(name).is_some_and(|a| a.index_nulls)
            {
                return Err(Error::client(format!(
                    "{}.{} does not index nulls; null cannot be searched",
                    ctx.collection, name
                )));
            }
            let max = ctx.config.max_key_bytes;
            let spec = RangeSpec::for_leaf(leaf, Some(max))?;
            Ok(Box::new(IndexHits {
                cursor: ctx.index_cursor(name, spec.range.reversed(reverse)),
                ctx: ctx.clone(),
                predicate: compile_leaf(leaf, ctx)?,
                recheck: spec.recheck,
                max_key_bytes: max,
                seen: ctx.is_multi_valued(name).then(HashSet::new),
            }))
        }
    }
}

/// Secondary index pairs resolved to primary keys.
struct IndexHits {
    cursor: IndexCursor,
    ctx: SearchContext,
    predicate: Predicate,
    recheck: bool,
    max_key_bytes: usize,
    /// Multi-valued attributes have one entry per element.
    seen: Option<HashSet<Key>>,
}

impl IndexHits {
    fn accept(&self, index_key: &Key, hit: &mut Hit) -> Result<bool> {
        if !self.recheck && !index_key.is_overflow(self.max_key_bytes) {
            return Ok(true);
        }
        match hit.load(&self.ctx)? {
            Some(record) => (self.predicate)(&record),
            None => Ok(false),
        }
    }
}

impl Iterator for IndexHits {
    type Item = Result<Hit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index_key, primary) = match self.cursor.next()? {
                Ok(pair) => pair,
                Err(e) => return Some(Err(e)),
            };
            if let Some(seen) = self.seen.as_mut() {
                if !seen.insert(primary.clone()) {
                    continue;
                }
            }
            let mut hit = Hit::key(primary);
            match self.accept(&index_key, &mut hit) {
                Ok(true) => return Some(Ok(hit)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::Condition;

    fn spec(condition: Condition, max: Option<usize>) -> RangeSpec {
        RangeSpec::for_leaf(condition.as_leaf().unwrap(), max).unwrap()
    }

    #[test]
    fn not_null_starts_after_null() {
        let range = spec(Condition::leaf("a", Comparator::NotEqual, Value::Null), None).range;
        assert!(!range.contains(&Key::Null));
        assert!(range.contains(&Key::Bool(false)));
    }

    #[test]
    fn starts_with_stops_at_successor() {
        let range = spec(Condition::leaf("a", Comparator::StartsWith, "ab"), Some(64)).range;
        assert!(range.contains(&Key::from("ab")));
        assert!(range.contains(&Key::from("abzzz")));
        assert!(!range.contains(&Key::from("ac")));
        assert!(!range.contains(&Key::from("aa")));
    }

    #[test]
    fn long_equals_spans_truncated_keys_and_rechecks() {
        let long = "x".repeat(40);
        let spec = spec(Condition::equals("a", long.as_str()), Some(16));
        assert!(spec.recheck);
        let stored = Key::from(long.as_str()).truncated(16);
        assert!(spec.range.contains(&stored));
        assert!(!spec.range.contains(&Key::from("y")));
    }

    #[test]
    fn upper_bounds_cover_values_stored_near_the_limit() {
        // 14 bytes: stored untruncated under a 16 byte limit, but past the
        // 12 byte budget used for truncated keys
        let high = "aaaaaaaaaaaaaz";
        let range = spec(Condition::leaf("a", Comparator::LessThanEqual, high), Some(16)).range;
        let lower_and_long = Key::from(format!("aaaaaaaaaaaaay{}", "q".repeat(20))).truncated(16);
        assert!(range.contains(&lower_and_long));
    }

    #[test]
    fn prefix_covers_longer_tuples() {
        let condition = Condition::leaf("a", Comparator::Prefix, Value::array(vec![Value::Int(1)]));
        let range = spec(condition, Some(64)).range;
        assert!(range.contains(&Key::Tuple(vec![Key::Int(1), Key::from("z")])));
        assert!(!range.contains(&Key::Tuple(vec![Key::Int(2)])));
    }

    #[test]
    fn unindexable_comparators_are_rejected() {
        let leaf = Condition::leaf("a", Comparator::Contains, "x");
        let err = RangeSpec::for_leaf(leaf.as_leaf().unwrap(), None).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Client);
    }
}
