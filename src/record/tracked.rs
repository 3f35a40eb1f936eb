use std::collections::BTreeMap;
use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::types::{Record, Value};
use crate::record::list::TrackedList;
use crate::schema::schema::{AttributeKind, Schema};

/// Own-data entry of a tracked record or list.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Value(Value),
    Record(TrackedRecord),
    List(TrackedList),
    Deleted,
}

impl Slot {
    pub(crate) fn to_value(&self) -> Option<Value> {
        match self {
            Slot::Value(v) => Some(v.clone()),
            Slot::Record(r) => Some(Value::object(r.collapse())),
            Slot::List(l) => Some(l.collapse()),
            Slot::Deleted => None,
        }
    }

    pub(crate) fn has_changes(&self) -> bool {
        match self {
            Slot::Value(_) | Slot::Deleted => true,
            Slot::Record(r) => r.has_changes(),
            Slot::List(l) => l.has_changes(),
        }
    }
}

/// Copy-on-write view over an immutable base record.
///
/// Reads check own data first and fall back to the base. Writes only ever
/// touch own data; the base is shared and never mutated. Nested objects and
/// arrays get their own tracked wrapper on first mutable access, and the
/// wrapper is cached so later accesses return the same one.
#[derive(Debug, Clone)]
pub struct TrackedRecord {
    base: Option<Arc<Record>>,
    schema: Option<Arc<Schema>>,
    own: Option<BTreeMap<String, Slot>>,
    // base came from the parent's own data rather than the parent's base
    replaced: bool,
}

impl TrackedRecord {
    pub fn new(base: Arc<Record>, schema: Option<Arc<Schema>>) -> Self {
        TrackedRecord {
            base: Some(base),
            schema,
            own: None,
            replaced: false,
        }
    }

    /// A record that does not exist yet; `has_changes` is always true.
    pub fn new_record(schema: Option<Arc<Schema>>) -> Self {
        TrackedRecord {
            base: None,
            schema,
            own: None,
            replaced: false,
        }
    }

    pub fn base(&self) -> Option<&Arc<Record>> {
        self.base.as_ref()
    }

    pub fn is_new(&self) -> bool {
        self.base.is_none()
    }

    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    fn own_mut(&mut self) -> &mut BTreeMap<String, Slot> {
        self.own.get_or_insert_with(BTreeMap::new)
    }

    fn base_value(&self, name: &str) -> Option<&Value> {
        self.base.as_ref().and_then(|b| b.get(name))
    }

    /// Current value of `name`, with any pending nested edits merged in.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.own.as_ref().and_then(|own| own.get(name)) {
            Some(slot) => slot.to_value(),
            None => self.base_value(name).cloned(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Validate against the declared attribute type, then store in own data.
    /// Wrong types fail here, not at commit.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let value = match self.schema.as_ref().and_then(|s| s.attribute(name)) {
            Some(attribute) => attribute.validate_write(value)?,
            None => value,
        };
        self.own_mut().insert(name.to_string(), Slot::Value(value));
        Ok(())
    }

    pub fn delete(&mut self, name: &str) {
        self.own_mut().insert(name.to_string(), Slot::Deleted);
    }

    fn nested_schema(&self, name: &str) -> Option<Arc<Schema>> {
        match self.schema.as_ref()?.attribute(name)?.kind {
            AttributeKind::Nested(ref schema) => Some(schema.clone()),
            _ => None,
        }
    }

    /// Tracked wrapper for the nested object at `name`, created on first call.
    pub fn record_mut(&mut self, name: &str) -> Result<&mut TrackedRecord> {
        let cached = matches!(self.own.as_ref().and_then(|own| own.get(name)), Some(Slot::Record(_)));
        if !cached {
            let replaced = self.own.as_ref().is_some_and(|own| own.contains_key(name));
            let nested = match self.get(name) {
                Some(Value::Object(nested)) => nested,
                other => return Err(Error::validation(name, other.unwrap_or(Value::Null), "an object")),
            };
            let mut wrapper = TrackedRecord::new(nested, self.nested_schema(name));
            wrapper.replaced = replaced;
            self.own_mut().insert(name.to_string(), Slot::Record(wrapper));
        }
        match self.own_mut().get_mut(name) {
            Some(Slot::Record(wrapper)) => Ok(wrapper),
            _ => Err(Error::internal(format!("tracked wrapper for {} vanished", name))),
        }
    }

    /// Tracked wrapper for the array at `name`, created on first call.
    pub fn list_mut(&mut self, name: &str) -> Result<&mut TrackedList> {
        let cached = matches!(self.own.as_ref().and_then(|own| own.get(name)), Some(Slot::List(_)));
        if !cached {
            let replaced = self.own.as_ref().is_some_and(|own| own.contains_key(name));
            let items = match self.get(name) {
                Some(Value::Array(items)) => items,
                other => return Err(Error::validation(name, other.unwrap_or(Value::Null), "an array")),
            };
            let element = self
                .schema
                .as_ref()
                .and_then(|s| s.attribute(name))
                .and_then(|a| a.elements.as_deref().cloned());
            let mut wrapper = TrackedList::new(items, element);
            if replaced {
                wrapper.mark_modified();
            }
            self.own_mut().insert(name.to_string(), Slot::List(wrapper));
        }
        match self.own_mut().get_mut(name) {
            Some(Slot::List(wrapper)) => Ok(wrapper),
            _ => Err(Error::internal(format!("tracked wrapper for {} vanished", name))),
        }
    }

    /// Merge own data over the base into a new plain record. Pure: neither
    /// the base nor this wrapper changes.
    pub fn collapse(&self) -> Record {
        let mut merged = self.base.as_deref().cloned().unwrap_or_default();
        if let Some(own) = &self.own {
            for (name, slot) in own {
                match slot.to_value() {
                    Some(value) => {
                        merged.insert(name.clone(), value);
                    }
                    None => {
                        merged.remove(name);
                    }
                }
            }
        }
        merged
    }

    /// Alias of [`TrackedRecord::collapse`] under its persistence name.
    pub fn to_persistent_value(&self) -> Record {
        self.collapse()
    }

    pub fn has_changes(&self) -> bool {
        if self.base.is_none() || self.replaced {
            return true;
        }
        self.own
            .as_ref()
            .is_some_and(|own| own.values().any(Slot::has_changes))
    }

    /// Names of attributes written directly on this record.
    pub fn changed_attributes(&self) -> Vec<&str> {
        self.own
            .iter()
            .flat_map(|own| own.iter())
            .filter(|(_, slot)| slot.has_changes())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// True when collapsing `tracked` would produce something other than its base.
pub fn has_changes(tracked: &TrackedRecord) -> bool {
    tracked.has_changes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::schema::schema::Attribute;

    fn base(json: serde_json::Value) -> Arc<Record> {
        Arc::new(Record::from_json(json).unwrap())
    }

    #[test]
    fn reads_fall_back_to_base() {
        let tracked = TrackedRecord::new(base(json!({"a": 1})), None);
        assert_eq!(tracked.get("a"), Some(Value::Int(1)));
        assert!(!tracked.has_changes());
    }

    #[test]
    fn nested_write_leaves_base_untouched() {
        let original = base(json!({"a": 1, "b": {"c": 2}}));
        let mut tracked = TrackedRecord::new(original.clone(), None);
        tracked.record_mut("b").unwrap().set("c", Value::Int(3)).unwrap();
        assert_eq!(Value::object(tracked.collapse()), Value::from(json!({"a": 1, "b": {"c": 3}})));
        assert_eq!(Value::Object(original), Value::from(json!({"a": 1, "b": {"c": 2}})));
        assert!(tracked.has_changes());
    }

    #[test]
    fn nested_wrapper_is_cached() {
        let mut tracked = TrackedRecord::new(base(json!({"b": {"c": 2}})), None);
        let first: *const TrackedRecord = tracked.record_mut("b").unwrap();
        let second: *const TrackedRecord = tracked.record_mut("b").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn touching_nested_without_writing_is_not_a_change() {
        let mut tracked = TrackedRecord::new(base(json!({"b": {"c": 2}})), None);
        tracked.record_mut("b").unwrap();
        assert!(!tracked.has_changes());
    }

    #[test]
    fn delete_removes_on_collapse() {
        let mut tracked = TrackedRecord::new(base(json!({"a": 1, "b": 2})), None);
        tracked.delete("a");
        assert_eq!(tracked.get("a"), None);
        assert!(!tracked.collapse().contains("a"));
    }

    #[test]
    fn wrapping_a_freshly_set_object_keeps_the_change() {
        let mut tracked = TrackedRecord::new(base(json!({"b": {"c": 2}})), None);
        tracked.set("b", Value::from(json!({"c": 5}))).unwrap();
        tracked.record_mut("b").unwrap();
        assert!(tracked.has_changes());
        assert_eq!(tracked.get("b"), Some(Value::from(json!({"c": 5}))));
    }

    #[test]
    fn new_records_always_have_changes() {
        assert!(TrackedRecord::new_record(None).has_changes());
    }

    #[test]
    fn set_validates_against_schema() {
        let schema = Arc::new(Schema::new("id").with_attribute(Attribute::new("age", AttributeKind::Int)));
        let mut tracked = TrackedRecord::new(base(json!({"id": 1})), Some(schema));
        assert!(tracked.set("age", Value::from("old")).is_err());
        tracked.set("age", Value::Float(41.000_000_01)).unwrap();
        assert_eq!(tracked.get("age"), Some(Value::Int(41)));
    }

    #[test]
    fn nested_schema_applies_to_nested_wrapper() {
        let address = Arc::new(Schema::nested().with_attribute(Attribute::new("zip", AttributeKind::String)));
        let schema = Arc::new(Schema::new("id").with_attribute(Attribute::new("address", AttributeKind::Nested(address))));
        let mut tracked = TrackedRecord::new(base(json!({"id": 1, "address": {"zip": "1"}})), Some(schema));
        let nested = tracked.record_mut("address").unwrap();
        assert!(nested.set("zip", Value::Int(2)).is_err());
    }

    #[test]
    fn record_mut_on_scalar_fails() {
        let mut tracked = TrackedRecord::new(base(json!({"a": 1})), None);
        assert!(tracked.record_mut("a").is_err());
    }
}
