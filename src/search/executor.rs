use std::collections::HashSet;
use crate::core::error::Result;
use crate::core::types::Value;
use crate::query::compiler::{compile_to_filter, Predicate};
use crate::query::condition::Condition;
use crate::query::planner::{Plan, QueryPlanner};
use crate::schema::schema::Relationship;
use crate::search::adaptive::AdaptiveFilter;
use crate::search::index_range::search_by_index;
use crate::search::join::JoinResolver;
use crate::search::results::{Hit, HitStream};
use crate::search::SearchContext;
use crate::storage::key::Key;
use crate::storage::KeyRange;

/// Execute plans against one collection snapshot
pub struct ConditionExecutor {
    ctx: SearchContext,
}

impl ConditionExecutor {
    pub fn new(ctx: SearchContext) -> Self {
        ConditionExecutor { ctx }
    }

    /// Plan and run a bare condition.
    pub fn execute(&self, condition: &Condition) -> Result<HitStream> {
        let plan = QueryPlanner::new(&self.ctx).plan_condition(condition)?;
        self.run(&plan)
    }

    /// Every operand is compiled and every cursor opened before the first
    /// hit is produced, so malformed conditions fail before any scan.
    pub fn run(&self, plan: &Plan) -> Result<HitStream> {
        match plan {
            Plan::FullScan { filter, reverse } => {
                let predicate = filter.as_ref().map(|c| compile_to_filter(c, &self.ctx)).transpose()?;
                let cursor = self.ctx.range_cursor(KeyRange::all().reversed(*reverse));
                Ok(Box::new(cursor.filter_map(move |entry| {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => return Some(Err(e)),
                    };
                    let keep = match &predicate {
                        Some(predicate) => predicate(&entry.record),
                        None => Ok(true),
                    };
                    match keep {
                        Ok(true) => Some(Ok(Hit::loaded(entry.key, entry.record))),
                        Ok(false) => None,
                        Err(e) => Some(Err(e)),
                    }
                })))
            }
            Plan::IndexRange { leaf, reverse } => search_by_index(leaf, &self.ctx, *reverse),
            Plan::Join { attribute, collection, inner } => {
                let related = self.ctx.related(collection)?;
                let right = ConditionExecutor::new(related.clone()).run(inner)?;
                let (definition, relationship) = self.ctx.relationship(attribute)?;
                let resolver = JoinResolver::new(self.ctx.clone());
                match relationship {
                    Relationship::From { local_attribute, .. } => resolver.join_from(local_attribute, right),
                    Relationship::To { foreign_attribute, .. } => {
                        let many_to_many =
                            definition.is_multi_valued() || related.is_multi_valued(foreign_attribute);
                        resolver.join_to(&related, foreign_attribute, many_to_many, right)
                    }
                }
            }
            Plan::Intersect { driver, filters } => {
                let input = self.run(driver)?;
                let mut steps = Vec::with_capacity(filters.len());
                for step in filters {
                    let predicate = compile_to_filter(&step.condition, &self.ctx)?;
                    steps.push(match step.condition.as_leaf() {
                        Some(leaf) if !leaf.is_path() => Step::Adaptive(AdaptiveFilter::new(
                            leaf.clone(),
                            predicate,
                            self.ctx.clone(),
                            step.incoming,
                            step.estimate,
                        )),
                        _ => Step::Predicate(predicate),
                    });
                }
                Ok(Box::new(FilteredStream {
                    input,
                    steps,
                    ctx: self.ctx.clone(),
                }))
            }
            Plan::Union { inputs } => {
                let streams = inputs.iter().map(|p| self.run(p)).collect::<Result<Vec<_>>>()?;
                let mut seen = HashSet::new();
                Ok(Box::new(streams.into_iter().flatten().filter(move |hit| match hit {
                    Ok(hit) => seen.insert(hit.key.clone()),
                    Err(_) => true,
                })))
            }
            Plan::SortInMemory { attribute, descending, input } => {
                let mut hits = Vec::new();
                for hit in self.run(input)? {
                    let mut hit = hit?;
                    let key = match hit.load(&self.ctx)? {
                        Some(record) => sort_key(record.get(attribute)),
                        None => continue,
                    };
                    hits.push((key, hit));
                }
                // stable, so ties keep the input order
                hits.sort_by(|(a, _), (b, _)| {
                    let order = a.cmp(b);
                    if *descending { order.reverse() } else { order }
                });
                Ok(Box::new(hits.into_iter().map(|(_, hit)| Ok(hit))))
            }
        }
    }
}

/// Any record whose attribute is missing sorts as null.
pub fn sort_key(value: Option<&Value>) -> Key {
    value.and_then(Key::from_value).unwrap_or(Key::Null)
}

enum Step {
    Adaptive(AdaptiveFilter),
    Predicate(Predicate),
}

impl Step {
    fn matches(&mut self, hit: &mut Hit, ctx: &SearchContext) -> Result<bool> {
        match self {
            Step::Adaptive(filter) => filter.matches(hit),
            Step::Predicate(predicate) => match hit.load(ctx)? {
                Some(record) => predicate(&record),
                None => Ok(false),
            },
        }
    }
}

/// Driver hits that pass every step.
struct FilteredStream {
    input: HitStream,
    steps: Vec<Step>,
    ctx: SearchContext,
}

impl FilteredStream {
    fn accept(&mut self, hit: &mut Hit) -> Result<bool> {
        for step in &mut self.steps {
            if !step.matches(hit, &self.ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Iterator for FilteredStream {
    type Item = Result<Hit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut hit = match self.input.next()? {
                Ok(hit) => hit,
                Err(e) => return Some(Err(e)),
            };
            match self.accept(&mut hit) {
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
    use serde_json::json;
    use crate::query::condition::Comparator;
    use crate::schema::schema::{Attribute, AttributeKind, Schema};
    use crate::search::testing::context;

    fn ctx() -> SearchContext {
        let schema = Schema::new("id")
            .with_attribute(Attribute::new("color", AttributeKind::String).indexed())
            .with_attribute(Attribute::new("age", AttributeKind::Int).indexed());
        let records = (0..200)
            .map(|i| json!({"id": i, "color": (["red", "green", "blue", "white"][i % 4]), "age": i % 50, "name": format!("n{:03}", 199 - i)}))
            .collect();
        context(schema, records)
    }

    fn keys(stream: HitStream) -> Vec<Key> {
        stream.map(|hit| hit.unwrap().key).collect()
    }

    fn scanned(ctx: &SearchContext, condition: &Condition) -> Vec<Key> {
        let plan = Plan::FullScan { filter: Some(condition.clone()), reverse: false };
        keys(ConditionExecutor::new(ctx.clone()).run(&plan).unwrap())
    }

    #[test]
    fn intersection_matches_filtered_scan() {
        let ctx = ctx();
        let condition = Condition::and(vec![
            Condition::equals("color", "red"),
            Condition::between("age", 10, 30),
            Condition::leaf("name", Comparator::StartsWith, "n1"),
        ]);
        let mut found = keys(ConditionExecutor::new(ctx.clone()).execute(&condition).unwrap());
        found.sort();
        assert!(!found.is_empty());
        assert_eq!(found, scanned(&ctx, &condition));
    }

    #[test]
    fn union_deduplicates() {
        let ctx = ctx();
        let condition = Condition::or(vec![Condition::equals("color", "red"), Condition::between("age", 0, 3)]);
        let mut found = keys(ConditionExecutor::new(ctx.clone()).execute(&condition).unwrap());
        let before = found.len();
        found.sort();
        found.dedup();
        assert_eq!(found.len(), before);
        assert_eq!(found, scanned(&ctx, &condition));
    }

    #[test]
    fn sort_in_memory_orders_and_is_stable() {
        let ctx = ctx();
        let plan = Plan::SortInMemory {
            attribute: "color".into(),
            descending: false,
            input: Box::new(Plan::FullScan { filter: None, reverse: false }),
        };
        let sorted = keys(ConditionExecutor::new(ctx.clone()).run(&plan).unwrap());
        assert_eq!(sorted.len(), 200);
        // blue first, ties in identity order
        assert_eq!(&sorted[..3], &[Key::Int(2), Key::Int(6), Key::Int(10)]);

        let plan = Plan::SortInMemory {
            attribute: "name".into(),
            descending: true,
            input: Box::new(Plan::FullScan { filter: None, reverse: false }),
        };
        let sorted = keys(ConditionExecutor::new(ctx).run(&plan).unwrap());
        assert_eq!(sorted.first(), Some(&Key::Int(0)));
        assert_eq!(sorted.last(), Some(&Key::Int(199)));
    }

    #[test]
    fn missing_attributes_sort_as_null() {
        assert_eq!(sort_key(None), Key::Null);
        assert_eq!(sort_key(Some(&Value::Int(3))), Key::Int(3));
    }
}
