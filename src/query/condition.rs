use std::sync::OnceLock;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};
use crate::core::types::Value;

/// Leaf comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    /// Inclusive; the value is a `[low, high]` array.
    Between,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    NotEqual,
    /// Ordered tuple prefix match.
    Prefix,
    /// Touch every record in attribute order without filtering.
    Sort,
}

impl Comparator {
    pub fn parse(name: &str) -> Result<Comparator> {
        Ok(match name {
            "equals" | "eq" => Comparator::Equals,
            "contains" => Comparator::Contains,
            "starts_with" => Comparator::StartsWith,
            "ends_with" => Comparator::EndsWith,
            "between" => Comparator::Between,
            "greater_than" | "gt" => Comparator::GreaterThan,
            "greater_than_equal" | "ge" => Comparator::GreaterThanEqual,
            "less_than" | "lt" => Comparator::LessThan,
            "less_than_equal" | "le" => Comparator::LessThanEqual,
            "not_equal" | "ne" => Comparator::NotEqual,
            "prefix" => Comparator::Prefix,
            "sort" => Comparator::Sort,
            other => return Err(Error::client(format!("Unknown query comparator \"{}\"", other))),
        })
    }

    /// Comparators an index range can answer (and adaptive promotion can use).
    pub fn is_index_friendly(&self) -> bool {
        matches!(
            self,
            Comparator::Equals | Comparator::StartsWith | Comparator::Between | Comparator::Prefix
        )
    }

    pub fn is_open_range(&self) -> bool {
        matches!(
            self,
            Comparator::GreaterThan
                | Comparator::GreaterThanEqual
                | Comparator::LessThan
                | Comparator::LessThanEqual
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    And,
    Or,
}

/// Single attribute/comparator/value triple. `attribute` is a path; more
/// than one segment traverses relationships.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub attribute: Vec<String>,
    pub comparator: Comparator,
    pub value: Option<Value>,
    pub descending: bool,
    estimate: OnceLock<f64>,
}

impl Leaf {
    pub fn new(attribute: Vec<String>, comparator: Comparator, value: Option<Value>) -> Self {
        Leaf {
            attribute,
            comparator,
            value,
            descending: false,
            estimate: OnceLock::new(),
        }
    }

    /// First path segment.
    pub fn name(&self) -> &str {
        self.attribute.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_path(&self) -> bool {
        self.attribute.len() > 1
    }

    /// The same comparison one relationship hop further down.
    pub fn tail(&self) -> Leaf {
        Leaf {
            attribute: self.attribute[1.min(self.attribute.len())..].to_vec(),
            comparator: self.comparator,
            value: self.value.clone(),
            descending: self.descending,
            estimate: OnceLock::new(),
        }
    }

    pub fn value(&self) -> Result<&Value> {
        self.value.as_ref().ok_or_else(|| {
            Error::client(format!(
                "Condition on {} with {:?} requires a value",
                self.attribute.join("."),
                self.comparator
            ))
        })
    }

    /// `[low, high]` of a between condition.
    pub fn bounds(&self) -> Result<(&Value, &Value)> {
        match self.value()? {
            Value::Array(items) if items.len() == 2 => Ok((&items[0], &items[1])),
            other => Err(Error::client(format!(
                "between on {} needs a [low, high] pair, got {}",
                self.attribute.join("."),
                other.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub conditions: Vec<Condition>,
    pub operator: Operator,
    estimate: OnceLock<f64>,
}

/// Query condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    Leaf(Leaf),
    Group(Group),
}

impl Condition {
    pub fn leaf(attribute: &str, comparator: Comparator, value: impl Into<Value>) -> Condition {
        Condition::Leaf(Leaf::new(vec![attribute.to_string()], comparator, Some(value.into())))
    }

    /// Condition reached through a chain of relationship attributes.
    pub fn path(path: &[&str], comparator: Comparator, value: impl Into<Value>) -> Condition {
        Condition::Leaf(Leaf::new(
            path.iter().map(|s| s.to_string()).collect(),
            comparator,
            Some(value.into()),
        ))
    }

    pub fn equals(attribute: &str, value: impl Into<Value>) -> Condition {
        Condition::leaf(attribute, Comparator::Equals, value)
    }

    pub fn between(attribute: &str, low: impl Into<Value>, high: impl Into<Value>) -> Condition {
        Condition::leaf(attribute, Comparator::Between, Value::array(vec![low.into(), high.into()]))
    }

    pub fn sort(attribute: &str, descending: bool) -> Condition {
        let mut leaf = Leaf::new(vec![attribute.to_string()], Comparator::Sort, None);
        leaf.descending = descending;
        Condition::Leaf(leaf)
    }

    pub fn group(operator: Operator, conditions: Vec<Condition>) -> Condition {
        Condition::Group(Group {
            conditions,
            operator,
            estimate: OnceLock::new(),
        })
    }

    pub fn and(conditions: Vec<Condition>) -> Condition {
        Condition::group(Operator::And, conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Condition {
        Condition::group(Operator::Or, conditions)
    }

    pub fn descending(mut self, descending: bool) -> Condition {
        if let Condition::Leaf(leaf) = &mut self {
            leaf.descending = descending;
        }
        self
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Condition::Leaf(leaf) => Some(leaf),
            Condition::Group(_) => None,
        }
    }

    /// Memo slot for the estimated matching count.
    pub fn estimate_slot(&self) -> &OnceLock<f64> {
        match self {
            Condition::Leaf(leaf) => &leaf.estimate,
            Condition::Group(group) => &group.estimate,
        }
    }

    pub fn cached_estimate(&self) -> Option<f64> {
        self.estimate_slot().get().copied()
    }

    /// Parse the transport form:
    /// `{"attribute": "a" | ["a","b"], "comparator": "equals", "value": ..., "descending": bool}`
    /// or `{"conditions": [...], "operator": "and" | "or"}`.
    pub fn from_json(json: &serde_json::Value) -> Result<Condition> {
        let object = json
            .as_object()
            .ok_or_else(|| Error::client("A condition must be an object"))?;
        if let Some(children) = object.get("conditions") {
            let children = children
                .as_array()
                .ok_or_else(|| Error::client("conditions must be an array"))?;
            let operator = match object.get("operator").and_then(|o| o.as_str()) {
                None | Some("and") => Operator::And,
                Some("or") => Operator::Or,
                Some(other) => return Err(Error::client(format!("Unknown operator \"{}\"", other))),
            };
            let conditions = children.iter().map(Condition::from_json).collect::<Result<Vec<_>>>()?;
            return Ok(Condition::group(operator, conditions));
        }
        let attribute = match object.get("attribute") {
            Some(serde_json::Value::String(name)) => vec![name.clone()],
            Some(serde_json::Value::Array(path)) => path
                .iter()
                .map(|segment| {
                    segment
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Error::client("attribute path segments must be strings"))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::client("A condition needs an attribute")),
        };
        let comparator = match object.get("comparator").and_then(|c| c.as_str()) {
            Some(name) => Comparator::parse(name)?,
            None => Comparator::Equals,
        };
        let value = object.get("value").cloned().map(Value::from);
        let mut leaf = Leaf::new(attribute, comparator, value);
        leaf.descending = object.get("descending").and_then(|d| d.as_bool()).unwrap_or(false);
        Ok(Condition::Leaf(leaf))
    }

    /// Reject malformed leaves before any scan starts.
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Group(group) => group.conditions.iter().try_for_each(Condition::validate),
            Condition::Leaf(leaf) => {
                if leaf.attribute.is_empty() || leaf.attribute.iter().any(String::is_empty) {
                    return Err(Error::client("Condition attribute may not be empty"));
                }
                match leaf.comparator {
                    Comparator::Sort => Ok(()),
                    Comparator::Between => leaf.bounds().map(|_| ()),
                    Comparator::Contains | Comparator::StartsWith | Comparator::EndsWith => {
                        match leaf.value()? {
                            Value::String(_) => Ok(()),
                            other => Err(Error::client(format!(
                                "{:?} on {} needs a string, got {}",
                                leaf.comparator,
                                leaf.attribute.join("."),
                                other.type_name()
                            ))),
                        }
                    }
                    _ => leaf.value().map(|_| ()),
                }
            }
        }
    }

    /// Rewrite `*x*`, `x*` and `*x` on equals into contains, starts_with
    /// and ends_with. A lone `*` means "any non-null value".
    pub fn rewrite_wildcards(self) -> Result<Condition> {
        match self {
            Condition::Group(group) => {
                let conditions = group
                    .conditions
                    .into_iter()
                    .map(Condition::rewrite_wildcards)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Condition::group(group.operator, conditions))
            }
            Condition::Leaf(leaf) => {
                let pattern = match (&leaf.comparator, &leaf.value) {
                    (Comparator::Equals, Some(Value::String(s))) if s.starts_with('*') || s.ends_with('*') => s.clone(),
                    _ => return Ok(Condition::Leaf(leaf)),
                };
                let (comparator, value) = wildcard(&pattern, &leaf.attribute)?;
                let mut rewritten = Leaf::new(leaf.attribute, comparator, Some(value));
                rewritten.descending = leaf.descending;
                Ok(Condition::Leaf(rewritten))
            }
        }
    }
}

fn wildcard(pattern: &str, attribute: &[String]) -> Result<(Comparator, Value)> {
    if pattern == "*" {
        return Ok((Comparator::NotEqual, Value::Null));
    }
    let leading = pattern.starts_with('*');
    let trailing = pattern.ends_with('*');
    let inner = pattern.trim_start_matches('*').trim_end_matches('*');
    if inner.is_empty() || pattern.len() - inner.len() > leading as usize + trailing as usize {
        return Err(Error::client(format!(
            "Invalid wildcard \"{}\" on {}",
            pattern,
            attribute.join(".")
        )));
    }
    let comparator = match (leading, trailing) {
        (true, true) => Comparator::Contains,
        (false, true) => Comparator::StartsWith,
        _ => Comparator::EndsWith,
    };
    Ok((comparator, Value::from(inner)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rewritten(pattern: &str) -> Result<Leaf> {
        let condition = Condition::equals("name", pattern).rewrite_wildcards()?;
        Ok(condition.as_leaf().unwrap().clone())
    }

    #[test]
    fn wildcards_become_string_comparators() {
        assert_eq!(rewritten("*foo*").unwrap().comparator, Comparator::Contains);
        assert_eq!(rewritten("foo*").unwrap().comparator, Comparator::StartsWith);
        let ends = rewritten("*foo").unwrap();
        assert_eq!(ends.comparator, Comparator::EndsWith);
        assert_eq!(ends.value, Some(Value::from("foo")));
        let any = rewritten("*").unwrap();
        assert_eq!((any.comparator, any.value), (Comparator::NotEqual, Some(Value::Null)));
    }

    #[test]
    fn inner_stars_are_literal() {
        let leaf = rewritten("a*b").unwrap();
        assert_eq!(leaf.comparator, Comparator::Equals);
    }

    #[test]
    fn malformed_wildcards_are_client_errors() {
        assert!(rewritten("**").is_err());
        assert!(rewritten("**foo").is_err());
    }

    #[test]
    fn leaves_need_values_except_sort() {
        let missing = Condition::Leaf(Leaf::new(vec!["a".into()], Comparator::Equals, None));
        assert!(missing.validate().is_err());
        assert!(Condition::sort("a", true).validate().is_ok());
        assert!(Condition::leaf("a", Comparator::Between, 5).validate().is_err());
    }

    #[test]
    fn parses_transport_form() {
        let condition = Condition::from_json(&json!({
            "operator": "or",
            "conditions": [
                {"attribute": "age", "comparator": "between", "value": [20, 40]},
                {"attribute": ["author", "name"], "comparator": "starts_with", "value": "Jo"}
            ]
        }))
        .unwrap();
        condition.validate().unwrap();
        let Condition::Group(group) = condition else { panic!("expected a group") };
        assert_eq!(group.operator, Operator::Or);
        let path = group.conditions[1].as_leaf().unwrap();
        assert!(path.is_path());
        assert_eq!(path.tail().attribute, vec!["name".to_string()]);
    }

    #[test]
    fn unknown_comparator_is_rejected() {
        assert!(Condition::from_json(&json!({"attribute": "a", "comparator": "like", "value": 1})).is_err());
    }
}
