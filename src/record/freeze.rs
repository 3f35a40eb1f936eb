use std::sync::Arc;
use serde::Serialize;
use crate::core::types::{Record, Value};
use crate::record::tracked::TrackedRecord;

/// Immutable, shareable result of [`deep_freeze`]. Nested objects and arrays
/// sit behind `Arc` and there is no mutable access to any of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrozenRecord(Arc<Record>);

impl FrozenRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_arc(&self) -> &Arc<Record> {
        &self.0
    }

    /// Plain owned copy, cloned only if the frozen record is still shared.
    pub fn into_record(self) -> Record {
        Arc::unwrap_or_clone(self.0)
    }
}

/// Collapse `tracked` and seal the result. Byte buffers are carried over
/// as-is: they keep sharing the original allocation.
pub fn deep_freeze(tracked: &TrackedRecord) -> FrozenRecord {
    let collapsed = tracked.collapse();
    FrozenRecord(Arc::new(collapsed.into_iter().map(|(k, v)| (k, freeze_value(v))).collect()))
}

fn freeze_value(value: Value) -> Value {
    match value {
        Value::Object(record) => {
            let record = Arc::unwrap_or_clone(record);
            Value::object(record.into_iter().map(|(k, v)| (k, freeze_value(v))).collect())
        }
        Value::Array(items) => Value::array(Arc::unwrap_or_clone(items).into_iter().map(freeze_value).collect()),
        // Bytes is already an immutable view; nothing to seal
        other => other,
    }
}
