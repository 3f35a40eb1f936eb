use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use serde::{Serialize, Deserialize};
use crate::core::types::Value;

/// Appended to string keys that were truncated to fit the maximum key size.
/// It is the highest code point, so a truncated key sorts after every
/// ordinary string sharing its prefix.
pub const OVERFLOW_MARKER: char = char::MAX;

/// Orderable key used both for record identities and secondary index entries.
///
/// Total order: `Null < Bool < numbers < Str < Bytes < Tuple < Max`.
/// `Int` and `Float` compare numerically with each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Key>),
    /// Only valid as a range bound.
    Max,
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Null => 0,
            Key::Bool(_) => 1,
            Key::Int(_) | Key::Float(_) => 2,
            Key::Str(_) => 3,
            Key::Bytes(_) => 4,
            Key::Tuple(_) => 5,
            Key::Max => 6,
        }
    }

    /// Convert an attribute value into a full-fidelity key (no truncation).
    /// Objects and arrays have no key form.
    pub fn from_value(value: &Value) -> Option<Key> {
        Some(match value {
            Value::Null => Key::Null,
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => Key::Float(*f),
            Value::BigInt(b) => match i64::try_from(*b) {
                Ok(i) => Key::Int(i),
                Err(_) => Key::Float(*b as f64),
            },
            Value::String(s) => Key::Str(s.clone()),
            Value::Date(d) => Key::Int(d.timestamp_millis()),
            Value::Bytes(b) => Key::Bytes(b.to_vec()),
            Value::Array(items) => Key::Tuple(
                items.iter().map(Key::from_value).collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(_) => return None,
        })
    }

    /// Convert to the form stored in an index: strings and byte strings longer
    /// than `max_bytes` are truncated and marked as overflowed.
    pub fn index_key(value: &Value, max_bytes: usize) -> Option<Key> {
        Key::from_value(value).map(|key| key.truncated(max_bytes))
    }

    pub fn truncated(self, max_bytes: usize) -> Key {
        match self {
            Key::Str(s) if s.len() > max_bytes => {
                let budget = max_bytes.saturating_sub(OVERFLOW_MARKER.len_utf8());
                let mut cut = budget.min(s.len());
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                let mut truncated = s[..cut].to_string();
                truncated.push(OVERFLOW_MARKER);
                Key::Str(truncated)
            }
            Key::Bytes(mut b) if b.len() > max_bytes => {
                b.truncate(max_bytes.saturating_sub(1));
                b.push(0xFF);
                Key::Bytes(b)
            }
            Key::Tuple(parts) => Key::Tuple(parts.into_iter().map(|p| p.truncated(max_bytes)).collect()),
            other => other,
        }
    }

    /// True when this key was (or could have been) produced by truncation, so
    /// a match against it must be confirmed on the stored record.
    pub fn is_overflow(&self, max_bytes: usize) -> bool {
        match self {
            Key::Str(s) => s.ends_with(OVERFLOW_MARKER) && s.len() >= max_bytes.saturating_sub(OVERFLOW_MARKER.len_utf8()),
            Key::Bytes(b) => b.len() == max_bytes && b.last() == Some(&0xFF),
            Key::Tuple(parts) => parts.iter().any(|p| p.is_overflow(max_bytes)),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Back to a plain value (used when joining on identities).
    pub fn to_value(&self) -> Value {
        match self {
            Key::Null | Key::Max => Value::Null,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Float(f) => Value::Float(*f),
            Key::Str(s) => Value::String(s.clone()),
            Key::Bytes(b) => Value::Bytes(b.clone().into()),
            Key::Tuple(parts) => Value::array(parts.iter().map(Key::to_value).collect()),
        }
    }

    /// Does this tuple key start with every element of `prefix`?
    pub fn has_prefix(&self, prefix: &Key) -> bool {
        match (self, prefix) {
            (Key::Tuple(parts), Key::Tuple(head)) => {
                head.len() <= parts.len() && parts.iter().zip(head).all(|(a, b)| a == b)
            }
            (key, single) => key == single,
        }
    }
}

/// Smallest string strictly greater than every string starting with `prefix`,
/// or `None` when no such bound exists.
pub fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // skip the surrogate gap
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// 2^63, the first float above every i64.
const I64_END: f64 = 9_223_372_036_854_775_808.0;

/// Exact comparison; the integer is never rounded to a float.
fn compare_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        // same side as total_cmp puts NaN
        return if f.is_sign_negative() { Ordering::Greater } else { Ordering::Less };
    }
    if f >= I64_END {
        return Ordering::Less;
    }
    if f < -I64_END {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

fn compare_floats(x: f64, y: f64) -> Ordering {
    // -0.0 == 0.0, NaN ordered by total_cmp
    x.partial_cmp(&y).unwrap_or_else(|| x.total_cmp(&y))
}

fn compare_numbers(a: &Key, b: &Key) -> Ordering {
    match (a, b) {
        (Key::Int(x), Key::Int(y)) => x.cmp(y),
        (Key::Int(x), Key::Float(y)) => compare_int_float(*x, *y),
        (Key::Float(x), Key::Int(y)) => compare_int_float(*y, *x).reverse(),
        (Key::Float(x), Key::Float(y)) => compare_floats(*x, *y),
        _ => Ordering::Equal,
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (self, other) {
            (Key::Bool(a), Key::Bool(b)) => a.cmp(b),
            (Key::Str(a), Key::Str(b)) => a.cmp(b),
            (Key::Bytes(a), Key::Bytes(b)) => a.cmp(b),
            (Key::Tuple(a), Key::Tuple(b)) => a.cmp(b),
            (Key::Int(_) | Key::Float(_), _) => compare_numbers(self, other),
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Key::Bool(b) => b.hash(state),
            // Int(1) == Float(1.0), so integral floats hash as integers
            Key::Int(i) => i.hash(state),
            Key::Float(f) => {
                if f.fract() == 0.0 && *f >= -I64_END && *f < I64_END {
                    (*f as i64).hash(state)
                } else {
                    f.to_bits().hash(state)
                }
            }
            Key::Str(s) => s.hash(state),
            Key::Bytes(b) => b.hash(state),
            Key::Tuple(parts) => parts.hash(state),
            Key::Null | Key::Max => {}
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Null => write!(f, "null"),
            Key::Bool(b) => write!(f, "{}", b),
            Key::Int(i) => write!(f, "{}", i),
            Key::Float(x) => write!(f, "{}", x),
            Key::Str(s) => write!(f, "{:?}", s),
            Key::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Key::Tuple(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, "]")
            }
            Key::Max => write!(f, "<max>"),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}
