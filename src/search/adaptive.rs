use std::collections::HashSet;
use tracing::info;
use crate::core::error::Result;
use crate::query::compiler::Predicate;
use crate::query::condition::Leaf;
use crate::search::index_range::search_by_index;
use crate::search::results::Hit;
use crate::search::{IndexState, SearchContext};
use crate::storage::key::Key;

/// Where an adaptive filter gets its answers from.
#[derive(Debug)]
pub enum FilterState {
    /// Evaluating the predicate on every incoming record.
    Scanning { misses: u64, filtered: u64 },
    /// Matching keys from one index search; membership replaces the predicate.
    IndexBacked(HashSet<Key>),
}

/// Trailing operand of an intersection. Starts by testing each record and
/// switches, at most once, to an index-backed key set when the projected
/// number of remaining misses crosses a threshold. Either way it accepts
/// exactly the same records.
pub struct AdaptiveFilter {
    leaf: Leaf,
    predicate: Predicate,
    ctx: SearchContext,
    incoming: f64,
    threshold: f64,
    eligible: bool,
    state: FilterState,
    pub promotions: usize,
}

impl AdaptiveFilter {
    /// `incoming` is the estimated size of the stream being filtered and
    /// `estimate` the leaf's own estimated match count.
    pub fn new(leaf: Leaf, predicate: Predicate, ctx: SearchContext, incoming: f64, estimate: f64) -> Self {
        let eligible = !leaf.is_path()
            && ctx.index_state(leaf.name()) == IndexState::Ready
            && leaf.comparator.is_index_friendly()
            && incoming > ctx.config.adaptive_min_incoming;
        let threshold = if estimate.is_finite() {
            ((estimate.max(0.0) as u64) >> ctx.config.adaptive_threshold_shift) as f64
        } else {
            f64::INFINITY
        };
        AdaptiveFilter {
            leaf,
            predicate,
            ctx,
            incoming,
            threshold,
            eligible,
            state: FilterState::Scanning { misses: 0, filtered: 0 },
            promotions: 0,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    pub fn is_promoted(&self) -> bool {
        matches!(self.state, FilterState::IndexBacked(_))
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn matches(&mut self, hit: &mut Hit) -> Result<bool> {
        let (misses, filtered) = match &mut self.state {
            FilterState::IndexBacked(keys) => return Ok(keys.contains(&hit.key)),
            FilterState::Scanning { misses, filtered } => (misses, filtered),
        };
        let matched = match hit.load(&self.ctx)? {
            Some(record) => (self.predicate)(&record)?,
            None => false,
        };
        *filtered += 1;
        if !matched {
            *misses += 1;
        }
        if self.eligible {
            let (misses, filtered) = (*misses as f64, *filtered as f64);
            let projected = misses / filtered * (self.incoming - filtered);
            if projected > self.threshold {
                self.promote(misses, projected)?;
            }
        }
        Ok(matched)
    }

    fn promote(&mut self, misses: f64, projected: f64) -> Result<()> {
        let keys = search_by_index(&self.leaf, &self.ctx, false)?
            .map(|hit| hit.map(|h| h.key))
            .collect::<Result<HashSet<_>>>()?;
        info!(
            collection = %self.ctx.collection,
            attribute = %self.leaf.attribute.join("."),
            comparator = ?self.leaf.comparator,
            misses,
            projected,
            threshold = self.threshold,
            matched = keys.len(),
            "adaptive filter promoted to index lookup"
        );
        self.state = FilterState::IndexBacked(keys);
        self.promotions += 1;
        Ok(())
    }
}
