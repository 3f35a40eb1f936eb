use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use crate::record::tracked::{Slot, TrackedRecord};
use crate::schema::schema::{Attribute, AttributeKind};

/// Copy-on-write view over an immutable array value.
///
/// The base array is shared until the first structural write, at which
/// point the elements are copied into own data. Nested objects get a
/// cached [`TrackedRecord`] wrapper, like attributes of a tracked record.
#[derive(Debug, Clone)]
pub struct TrackedList {
    base: Arc<Vec<Value>>,
    element: Option<Attribute>,
    own: Option<Vec<Slot>>,
    modified: bool,
}

impl TrackedList {
    pub fn new(base: Arc<Vec<Value>>, element: Option<Attribute>) -> Self {
        TrackedList {
            base,
            element,
            own: None,
            modified: false,
        }
    }

    /// Treat the list as changed even without element writes (its base
    /// replaced the parent's stored value).
    pub(crate) fn mark_modified(&mut self) {
        self.modified = true;
    }

    fn own_mut(&mut self) -> &mut Vec<Slot> {
        let base = &self.base;
        self.own
            .get_or_insert_with(|| base.iter().cloned().map(Slot::Value).collect())
    }

    pub fn len(&self) -> usize {
        match &self.own {
            Some(own) => own.len(),
            None => self.base.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        match &self.own {
            Some(own) => own.get(index).and_then(Slot::to_value),
            None => self.base.get(index).cloned(),
        }
    }

    fn validate(&self, index: usize, value: Value) -> Result<Value> {
        match &self.element {
            Some(element) => element
                .validate_write(value)
                .map_err(|e| Error::new(e.kind, format!("{} (element {})", e.context, index))),
            None => Ok(value),
        }
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<()> {
        if index >= self.len() {
            return Err(Error::client(format!("index {} out of bounds for list of {}", index, self.len())));
        }
        let value = self.validate(index, value)?;
        self.own_mut()[index] = Slot::Value(value);
        self.modified = true;
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        let value = self.validate(self.len(), value)?;
        self.own_mut().push(Slot::Value(value));
        self.modified = true;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Value> {
        if index >= self.len() {
            return Err(Error::client(format!("index {} out of bounds for list of {}", index, self.len())));
        }
        let removed = self.own_mut().remove(index);
        self.modified = true;
        Ok(removed.to_value().unwrap_or(Value::Null))
    }

    /// Tracked wrapper for the object at `index`, created on first call.
    pub fn record_mut(&mut self, index: usize) -> Result<&mut TrackedRecord> {
        let schema = match self.element.as_ref().map(|e| &e.kind) {
            Some(AttributeKind::Nested(schema)) => Some(schema.clone()),
            _ => None,
        };
        let own = self.own_mut();
        let slot = own
            .get_mut(index)
            .ok_or_else(|| Error::client(format!("index {} out of bounds", index)))?;
        if let Slot::Value(value) = slot {
            let nested = match value {
                Value::Object(nested) => nested.clone(),
                other => return Err(Error::validation(&format!("[{}]", index), other.clone(), "an object")),
            };
            *slot = Slot::Record(TrackedRecord::new(nested, schema));
        }
        match slot {
            Slot::Record(wrapper) => Ok(wrapper),
            _ => Err(Error::internal(format!("element {} is not an object", index))),
        }
    }

    /// New array value with pending edits applied. Shares the base array
    /// when nothing was touched.
    pub fn collapse(&self) -> Value {
        match &self.own {
            Some(own) if self.has_changes() => Value::array(own.iter().filter_map(Slot::to_value).collect()),
            _ => Value::Array(self.base.clone()),
        }
    }

    pub fn has_changes(&self) -> bool {
        if self.modified {
            return true;
        }
        self.own
            .as_ref()
            .is_some_and(|own| own.iter().any(|slot| matches!(slot, Slot::Record(r) if r.has_changes())))
    }
}
