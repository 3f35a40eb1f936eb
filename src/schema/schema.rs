use std::sync::Arc;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, Result};
use crate::core::types::{Record, Value};

/// Distance from the nearest integer under which a float is silently rounded
/// when written to an integer-typed attribute.
pub const INTEGER_ROUNDING_TOLERANCE: f64 = 1e-7;

const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Declared type of an attribute. Each variant owns one validating write
/// function, picked when the schema is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeKind {
    String,
    Id,
    Float,
    Int,
    Long,
    BigInt,
    Boolean,
    Date,
    Bytes,
    Any,
    Nested(Arc<Schema>),
}

/// Direction of a relationship attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Relationship {
    /// This collection is the "one" side; `foreign_attribute` on `collection`
    /// holds our primary key.
    To { collection: String, foreign_attribute: String },
    /// This collection holds the foreign key in `local_attribute`, pointing at
    /// the primary key of `collection`.
    From { collection: String, local_attribute: String },
}

impl Relationship {
    pub fn collection(&self) -> &str {
        match self {
            Relationship::To { collection, .. } | Relationship::From { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    pub nullable: bool,
    pub indexed: bool,
    pub index_nulls: bool,
    pub relationship: Option<Relationship>,
    /// Present for multi-valued attributes; describes each element.
    pub elements: Option<Box<Attribute>>,
}

impl Attribute {
    pub fn new(name: &str, kind: AttributeKind) -> Self {
        Attribute {
            name: name.to_string(),
            kind,
            nullable: true,
            indexed: false,
            index_nulls: true,
            relationship: None,
            elements: None,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn without_null_index(mut self) -> Self {
        self.index_nulls = false;
        self
    }

    pub fn elements(mut self, kind: AttributeKind) -> Self {
        self.elements = Some(Box::new(Attribute::new(&self.name, kind)));
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationship = Some(relationship);
        self
    }

    pub fn is_multi_valued(&self) -> bool {
        self.elements.is_some()
    }

    /// Validate (and leniently coerce) a value about to be written.
    pub fn validate_write(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err(Error::validation(&self.name, &value, "non-null"))
            };
        }
        if let Some(element) = &self.elements {
            let Value::Array(items) = &value else {
                return Err(Error::validation(&self.name, &value, "an array"));
            };
            let validated = items
                .iter()
                .map(|item| element.validate_write(item.clone()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Value::array(validated));
        }
        self.kind.coerce(&self.name, value)
    }
}

impl AttributeKind {
    pub fn from_type_name(name: &str) -> Option<AttributeKind> {
        Some(match name {
            "String" => AttributeKind::String,
            "ID" => AttributeKind::Id,
            "Float" => AttributeKind::Float,
            "Int" => AttributeKind::Int,
            "Long" => AttributeKind::Long,
            "BigInt" => AttributeKind::BigInt,
            "Boolean" => AttributeKind::Boolean,
            "Date" => AttributeKind::Date,
            "Bytes" => AttributeKind::Bytes,
            "Any" => AttributeKind::Any,
            _ => return None,
        })
    }

    fn coerce(&self, attribute: &str, value: Value) -> Result<Value> {
        match self {
            AttributeKind::Any => Ok(value),
            AttributeKind::String => match value {
                Value::String(_) => Ok(value),
                other => Err(Error::validation(attribute, other, "a string")),
            },
            AttributeKind::Id => match value {
                Value::String(_) | Value::Int(_) | Value::BigInt(_) => Ok(value),
                other => Err(Error::validation(attribute, other, "a string or integer id")),
            },
            AttributeKind::Float => match value {
                Value::Float(_) => Ok(value),
                Value::Int(i) => Ok(Value::Float(i as f64)),
                Value::BigInt(b) => Ok(Value::Float(b as f64)),
                other => Err(Error::validation(attribute, other, "a number")),
            },
            AttributeKind::Int => coerce_integer(attribute, value, i32::MIN as i64, i32::MAX as i64, "a 32-bit integer"),
            AttributeKind::Long => coerce_integer(attribute, value, -MAX_SAFE_INTEGER, MAX_SAFE_INTEGER, "a safe integer"),
            AttributeKind::BigInt => match value {
                Value::BigInt(_) => Ok(value),
                Value::Int(i) => Ok(Value::BigInt(i as i128)),
                Value::Float(f) => match round_near_integer(f) {
                    Some(rounded) => Ok(Value::BigInt(rounded as i128)),
                    None => Err(Error::validation(attribute, f, "an integer")),
                },
                other => Err(Error::validation(attribute, other, "an integer")),
            },
            AttributeKind::Boolean => match value {
                Value::Bool(_) => Ok(value),
                other => Err(Error::validation(attribute, other, "a boolean")),
            },
            AttributeKind::Date => match value {
                Value::Date(_) => Ok(value),
                Value::Int(millis) => Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .map(Value::Date)
                    .ok_or_else(|| Error::validation(attribute, millis, "a valid date")),
                Value::String(s) => DateTime::parse_from_rfc3339(&s)
                    .map(|d| Value::Date(d.with_timezone(&Utc)))
                    .map_err(|_| Error::validation(attribute, &s, "a date")),
                other => Err(Error::validation(attribute, other, "a date")),
            },
            AttributeKind::Bytes => match value {
                Value::Bytes(_) => Ok(value),
                other => Err(Error::validation(attribute, other, "a byte buffer")),
            },
            AttributeKind::Nested(schema) => match value {
                Value::Object(record) => Ok(Value::object(schema.validate_record(&record)?)),
                other => Err(Error::validation(attribute, other, "an object")),
            },
        }
    }
}

fn round_near_integer(f: f64) -> Option<i64> {
    let rounded = f.round();
    if f.is_finite() && (f - rounded).abs() < INTEGER_ROUNDING_TOLERANCE {
        Some(rounded as i64)
    } else {
        None
    }
}

fn coerce_integer(attribute: &str, value: Value, min: i64, max: i64, expected: &str) -> Result<Value> {
    let integer = match value {
        Value::Int(i) => i,
        Value::BigInt(b) if b >= min as i128 && b <= max as i128 => b as i64,
        Value::Float(f) => round_near_integer(f).ok_or_else(|| Error::validation(attribute, f, expected))?,
        other => return Err(Error::validation(attribute, other, expected)),
    };
    if integer < min || integer > max {
        return Err(Error::validation(attribute, integer, expected));
    }
    Ok(Value::Int(integer))
}

/// Ordered attribute definitions of one collection (or one nested object type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub primary_key: String,
    pub attributes: Vec<Attribute>,
}

impl Schema {
    pub fn new(primary_key: &str) -> Self {
        Schema {
            primary_key: primary_key.to_string(),
            attributes: vec![Attribute::new(primary_key, AttributeKind::Id)],
        }
    }

    /// Nested object types have no identity of their own.
    pub fn nested() -> Self {
        Schema {
            primary_key: String::new(),
            attributes: Vec::new(),
        }
    }

    /// Add or replace an attribute definition.
    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        match self.attributes.iter_mut().find(|a| a.name == attribute.name) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.name == name)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        !self.primary_key.is_empty() && self.primary_key == name
    }

    pub fn indexed_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.indexed && !self.is_primary_key(&a.name))
    }

    /// Validate every declared attribute present in `record`; undeclared
    /// attributes pass through untouched.
    pub fn validate_record(&self, record: &Record) -> Result<Record> {
        let mut validated = Record::new();
        for (name, value) in record.iter() {
            let value = match self.attribute(name) {
                Some(attribute) => attribute.validate_write(value.clone())?,
                None => value.clone(),
            };
            validated.insert(name.clone(), value);
        }
        for attribute in &self.attributes {
            if !attribute.nullable && !record.contains(&attribute.name) {
                return Err(Error::validation(&attribute.name, Value::Null, "present"));
            }
        }
        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_integer_float_is_rounded_for_int() {
        let attr = Attribute::new("age", AttributeKind::Int);
        assert_eq!(attr.validate_write(Value::Float(29.999_999_999_9)).unwrap(), Value::Int(30));
        assert!(attr.validate_write(Value::Float(29.5)).is_err());
    }

    #[test]
    fn int_range_is_enforced() {
        let attr = Attribute::new("n", AttributeKind::Int);
        assert!(attr.validate_write(Value::Int(i64::from(i32::MAX) + 1)).is_err());
        let long = Attribute::new("n", AttributeKind::Long);
        assert!(long.validate_write(Value::Int(i64::from(i32::MAX) + 1)).is_ok());
    }

    #[test]
    fn wrong_type_names_attribute() {
        let attr = Attribute::new("name", AttributeKind::String);
        let err = attr.validate_write(Value::Int(5)).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Validation);
        assert!(err.context.contains("name"));
    }

    #[test]
    fn required_attribute_rejects_null() {
        let attr = Attribute::new("name", AttributeKind::String).required();
        assert!(attr.validate_write(Value::Null).is_err());
    }

    #[test]
    fn multi_valued_attribute_validates_each_element() {
        let attr = Attribute::new("tags", AttributeKind::Any).elements(AttributeKind::String);
        assert!(attr.validate_write(Value::array(vec!["a".into(), "b".into()])).is_ok());
        assert!(attr.validate_write(Value::array(vec!["a".into(), Value::Int(1)])).is_err());
        assert!(attr.validate_write(Value::from("a")).is_err());
    }

    #[test]
    fn date_accepts_millis_and_rfc3339() {
        let attr = Attribute::new("at", AttributeKind::Date);
        assert!(matches!(attr.validate_write(Value::Int(0)).unwrap(), Value::Date(_)));
        assert!(matches!(attr.validate_write(Value::from("2024-01-01T00:00:00Z")).unwrap(), Value::Date(_)));
    }
}
