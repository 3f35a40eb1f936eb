use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::types::{Record, Value};
use crate::query::condition::{Comparator, Condition, Leaf, Operator};
use crate::schema::schema::Relationship;
use crate::search::SearchContext;
use crate::search::executor::ConditionExecutor;
use crate::storage::key::Key;

/// Compiled record test.
pub type Predicate = Arc<dyn Fn(&Record) -> Result<bool> + Send + Sync>;

/// Turn a condition tree into a record predicate.
///
/// Values compare through the `Key` total order, so the predicate accepts
/// exactly what an index range over the same condition returns. Missing
/// attributes compare as null, and multi-valued attributes match when any
/// element does.
pub fn compile_to_filter(condition: &Condition, ctx: &SearchContext) -> Result<Predicate> {
    match condition {
        Condition::Leaf(leaf) => compile_leaf(leaf, ctx),
        Condition::Group(group) => {
            let children = group
                .conditions
                .iter()
                .map(|c| compile_to_filter(c, ctx))
                .collect::<Result<Vec<_>>>()?;
            Ok(match group.operator {
                Operator::And => Arc::new(move |record: &Record| {
                    for child in &children {
                        if !child(record)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }),
                Operator::Or => Arc::new(move |record: &Record| {
                    for child in &children {
                        if child(record)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }),
            })
        }
    }
}

pub fn compile_leaf(leaf: &Leaf, ctx: &SearchContext) -> Result<Predicate> {
    if leaf.is_path() {
        return compile_path(leaf, ctx);
    }
    let name = leaf.name().to_string();
    if ctx.schema.attribute(&name).is_some_and(|a| a.relationship.is_some()) {
        return Err(Error::client(format!(
            "{}.{} is a relationship; name the related attribute to compare",
            ctx.collection, name
        )));
    }
    let test = Test::new(leaf)?;
    let multi_valued = ctx.is_multi_valued(&name);
    Ok(Arc::new(move |record: &Record| {
        let value = record.get(&name).unwrap_or(&Value::Null);
        Ok(match value {
            Value::Array(items) if multi_valued => items.iter().any(|item| test.matches(item)),
            single => test.matches(single),
        })
    }))
}

/// Values a foreign key attribute holds: every element of an array, or the
/// scalar itself. Nulls never reference anything.
pub(crate) fn foreign_keys(value: Option<&Value>) -> Vec<Key> {
    let keys = match value {
        None => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(Key::from_value).collect(),
        Some(single) => Key::from_value(single).into_iter().collect(),
    };
    keys.into_iter().filter(|k| *k != Key::Null).collect()
}

fn compile_path(leaf: &Leaf, ctx: &SearchContext) -> Result<Predicate> {
    let (_, relationship) = ctx.relationship(leaf.name())?;
    let relationship = relationship.clone();
    let related = ctx.related(relationship.collection())?;
    let tail = leaf.tail();
    match relationship {
        Relationship::From { local_attribute, .. } => {
            let inner = compile_leaf(&tail, &related)?;
            Ok(Arc::new(move |record: &Record| {
                for key in foreign_keys(record.get(&local_attribute)) {
                    if let Some(target) = related.fetch(&key)? {
                        if inner(&target)? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }))
        }
        Relationship::To { foreign_attribute, .. } => {
            // fail on a malformed tail now rather than per record
            compile_leaf(&tail, &related)?;
            let primary_key = ctx.schema.primary_key.clone();
            Ok(Arc::new(move |record: &Record| {
                let Some(identity) = record.get(&primary_key) else {
                    return Ok(false);
                };
                let lookup = Condition::and(vec![
                    Condition::equals(&foreign_attribute, identity.clone()),
                    Condition::Leaf(tail.clone()),
                ]);
                let mut hits = ConditionExecutor::new(related.clone()).execute(&lookup)?;
                match hits.next() {
                    None => Ok(false),
                    Some(hit) => hit.map(|_| true),
                }
            }))
        }
    }
}

/// A leaf with its operand converted to keys once.
enum Test {
    Equals(Key),
    NotEqual(Key),
    GreaterThan(Key),
    GreaterThanEqual(Key),
    LessThan(Key),
    LessThanEqual(Key),
    Between(Key, Key),
    StartsWith(String),
    Contains(String),
    EndsWith(String),
    Prefix(Key),
    Always,
}

fn operand(leaf: &Leaf, value: &Value) -> Result<Key> {
    Key::from_value(value).ok_or_else(|| {
        Error::client(format!(
            "{} cannot be compared with {}",
            leaf.attribute.join("."),
            value.type_name()
        ))
    })
}

fn text(leaf: &Leaf) -> Result<String> {
    leaf.value()?.as_str().map(str::to_string).ok_or_else(|| {
        Error::client(format!("{:?} on {} needs a string", leaf.comparator, leaf.attribute.join(".")))
    })
}

/// Scalars are one-element prefixes.
pub(crate) fn prefix_key(key: Key) -> Key {
    match key {
        Key::Tuple(parts) => Key::Tuple(parts),
        single => Key::Tuple(vec![single]),
    }
}

impl Test {
    fn new(leaf: &Leaf) -> Result<Test> {
        Ok(match leaf.comparator {
            Comparator::Equals => Test::Equals(operand(leaf, leaf.value()?)?),
            Comparator::NotEqual => Test::NotEqual(operand(leaf, leaf.value()?)?),
            Comparator::GreaterThan => Test::GreaterThan(operand(leaf, leaf.value()?)?),
            Comparator::GreaterThanEqual => Test::GreaterThanEqual(operand(leaf, leaf.value()?)?),
            Comparator::LessThan => Test::LessThan(operand(leaf, leaf.value()?)?),
            Comparator::LessThanEqual => Test::LessThanEqual(operand(leaf, leaf.value()?)?),
            Comparator::Between => {
                let (low, high) = leaf.bounds()?;
                Test::Between(operand(leaf, low)?, operand(leaf, high)?)
            }
            Comparator::StartsWith => Test::StartsWith(text(leaf)?),
            Comparator::Contains => Test::Contains(text(leaf)?),
            Comparator::EndsWith => Test::EndsWith(text(leaf)?),
            Comparator::Prefix => Test::Prefix(prefix_key(operand(leaf, leaf.value()?)?)),
            Comparator::Sort => Test::Always,
        })
    }

    fn matches(&self, value: &Value) -> bool {
        let Some(key) = Key::from_value(value) else {
            return false;
        };
        // nulls fall outside every ordered range
        let ordered = key != Key::Null;
        match self {
            Test::Equals(target) => key == *target,
            Test::NotEqual(target) => key != *target,
            Test::GreaterThan(target) => ordered && key > *target,
            Test::GreaterThanEqual(target) => ordered && key >= *target,
            Test::LessThan(target) => ordered && key < *target,
            Test::LessThanEqual(target) => ordered && key <= *target,
            Test::Between(low, high) => ordered && key >= *low && key <= *high,
            Test::StartsWith(s) => key.as_str().is_some_and(|k| k.starts_with(s.as_str())),
            Test::Contains(s) => key.as_str().is_some_and(|k| k.contains(s.as_str())),
            Test::EndsWith(s) => key.as_str().is_some_and(|k| k.ends_with(s.as_str())),
            Test::Prefix(prefix) => key.has_prefix(prefix),
            Test::Always => true,
        }
    }
}
