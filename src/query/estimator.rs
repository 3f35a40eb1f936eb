use crate::core::error::Result;
use crate::core::types::Value;
use crate::query::condition::{Comparator, Condition, Leaf, Operator};
use crate::schema::schema::Relationship;
use crate::search::{IndexState, SearchContext};
use crate::storage::key::Key;

/// Assigns each condition an expected matching record count.
///
/// The fractions only rank conditions against each other. `f64::INFINITY` means "cannot be
/// answered without a full scan". Results are memoized on the condition.
pub struct CostEstimator<'a> {
    ctx: &'a SearchContext,
    sort_attribute: Option<&'a str>,
}

impl<'a> CostEstimator<'a> {
    pub fn new(ctx: &'a SearchContext, sort_attribute: Option<&'a str>) -> Self {
        CostEstimator { ctx, sort_attribute }
    }

    pub fn estimate(&self, condition: &Condition) -> Result<f64> {
        if let Some(estimate) = condition.cached_estimate() {
            return Ok(estimate);
        }
        let estimate = match condition {
            Condition::Leaf(leaf) => self.estimate_leaf(leaf)?,
            Condition::Group(group) => match group.operator {
                Operator::Or => {
                    let mut sum = 0.0;
                    for child in &group.conditions {
                        sum += self.estimate(child)?;
                    }
                    sum
                }
                Operator::And => {
                    let mut estimates = group
                        .conditions
                        .iter()
                        .map(|c| self.estimate(c))
                        .collect::<Result<Vec<_>>>()?;
                    estimates.sort_by(f64::total_cmp);
                    let total = self.ctx.stats.total()?.max(1) as f64;
                    let mut running = estimates.first().copied().unwrap_or(total);
                    for child in estimates.iter().skip(1) {
                        running *= (child / total).min(1.0);
                    }
                    running
                }
            },
        };
        let _ = condition.estimate_slot().set(estimate);
        Ok(estimate)
    }

    fn estimate_leaf(&self, leaf: &Leaf) -> Result<f64> {
        if leaf.is_path() {
            return self.estimate_path(leaf);
        }
        let name = leaf.name();
        let state = self.ctx.index_state(name);
        if state == IndexState::Primary && leaf.comparator == Comparator::Equals {
            return Ok(1.0);
        }
        let config = &self.ctx.config;
        let total = self.ctx.stats.total()? as f64;
        let estimate = match (state, leaf.comparator) {
            (IndexState::Missing, _) => f64::INFINITY,
            (_, Comparator::Contains | Comparator::EndsWith) => f64::INFINITY,
            (_, Comparator::NotEqual) => match leaf.value()? {
                Value::Null => total * config.open_range_fraction,
                _ => f64::INFINITY,
            },
            (_, Comparator::Equals) => {
                match Key::index_key(leaf.value()?, config.max_key_bytes) {
                    Some(key) => self.ctx.stats.value_count(name, &key)? as f64,
                    None => 0.0,
                }
            }
            (_, Comparator::StartsWith | Comparator::Prefix) => total * config.starts_with_fraction,
            (_, Comparator::Between) => total * config.between_fraction,
            (_, Comparator::Sort) => total,
            (_, _) => total * config.open_range_fraction,
        };
        if self.sort_attribute == Some(name) {
            return Ok(estimate / 2.0);
        }
        Ok(estimate)
    }

    /// Matches on the related side carried across the foreign-key index.
    /// Without a usable index the related estimate is scaled by the relative
    /// collection sizes.
    fn estimate_path(&self, leaf: &Leaf) -> Result<f64> {
        let (_, relationship) = self.ctx.relationship(leaf.name())?;
        let related = self.ctx.related(relationship.collection())?;
        let tail = leaf.tail();
        let total = self.ctx.stats.total()? as f64;
        match relationship {
            Relationship::From { local_attribute, .. } => match self.ctx.index_state(local_attribute) {
                IndexState::Missing => return Ok(f64::INFINITY),
                IndexState::Ready => {
                    // one known related key: count the references to it
                    if !tail.is_path()
                        && tail.comparator == Comparator::Equals
                        && related.schema.is_primary_key(tail.name())
                    {
                        return match Key::index_key(tail.value()?, self.ctx.config.max_key_bytes) {
                            Some(key) => Ok(self.ctx.stats.value_count(local_attribute, &key)? as f64),
                            None => Ok(0.0),
                        };
                    }
                    let inner = CostEstimator::new(&related, None).estimate_leaf(&tail)?;
                    if inner.is_infinite() {
                        return Ok(f64::INFINITY);
                    }
                    let fanout = self.ctx.stats.index_fanout(local_attribute)?;
                    return Ok((inner * fanout).min(total));
                }
                IndexState::Primary | IndexState::Building => {}
            },
            Relationship::To { foreign_attribute, .. } => {
                if related.index_state(foreign_attribute) == IndexState::Ready {
                    let inner = CostEstimator::new(&related, None).estimate_leaf(&tail)?;
                    if inner.is_infinite() {
                        return Ok(f64::INFINITY);
                    }
                    // related records sharing a foreign key reach one of ours
                    let fanout = related.stats.index_fanout(foreign_attribute)?.max(1.0);
                    return Ok((inner / fanout).min(total));
                }
            }
        }
        let inner = CostEstimator::new(&related, None).estimate_leaf(&tail)?;
        if inner.is_infinite() {
            return Ok(f64::INFINITY);
        }
        let related_total = related.stats.total()?.max(1) as f64;
        Ok(inner / related_total * total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::schema::schema::{Attribute, AttributeKind, Schema};
    use crate::search::testing::context;

    fn ctx() -> SearchContext {
        let schema = Schema::new("id")
            .with_attribute(Attribute::new("color", AttributeKind::String).indexed())
            .with_attribute(Attribute::new("age", AttributeKind::Int).indexed());
        let records = (0..100)
            .map(|i| json!({"id": i, "color": if i % 10 == 0 { "red" } else { "blue" }, "age": i}))
            .collect();
        context(schema, records)
    }

    #[test]
    fn identity_equality_is_one() {
        let ctx = ctx();
        let estimator = CostEstimator::new(&ctx, Some("id"));
        assert_eq!(estimator.estimate(&Condition::equals("id", 5)).unwrap(), 1.0);
    }

    #[test]
    fn indexed_equality_uses_value_counts() {
        let ctx = ctx();
        let estimator = CostEstimator::new(&ctx, None);
        assert_eq!(estimator.estimate(&Condition::equals("color", "red")).unwrap(), 10.0);
        assert_eq!(estimator.estimate(&Condition::equals("color", "blue")).unwrap(), 90.0);
    }

    #[test]
    fn fractions_and_unindexed() {
        let ctx = ctx();
        let estimator = CostEstimator::new(&ctx, None);
        assert_eq!(estimator.estimate(&Condition::between("age", 1, 5)).unwrap(), 10.0);
        assert_eq!(estimator.estimate(&Condition::leaf("age", Comparator::GreaterThan, 5)).unwrap(), 30.0);
        assert!(estimator.estimate(&Condition::equals("name", "x")).unwrap().is_infinite());
        assert!(estimator.estimate(&Condition::leaf("color", Comparator::Contains, "e")).unwrap().is_infinite());
    }

    #[test]
    fn or_sums_and_and_chains_ratios() {
        let ctx = ctx();
        let estimator = CostEstimator::new(&ctx, None);
        let red = Condition::equals("color", "red");
        let range = Condition::between("age", 1, 5);
        let or = Condition::or(vec![red.clone(), range.clone()]);
        assert_eq!(estimator.estimate(&or).unwrap(), 20.0);
        let and = Condition::and(vec![red, range]);
        assert!((estimator.estimate(&and).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sort_attribute_is_halved_and_memoized() {
        let ctx = ctx();
        let condition = Condition::between("age", 1, 5);
        assert_eq!(CostEstimator::new(&ctx, Some("age")).estimate(&condition).unwrap(), 5.0);
        assert_eq!(condition.cached_estimate(), Some(5.0));
        // memoized value wins
        assert_eq!(CostEstimator::new(&ctx, None).estimate(&condition).unwrap(), 5.0);
    }
}
