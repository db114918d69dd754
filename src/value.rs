//! Dynamic values carried by facts, contexts, memories and params.
//!
//! Rule facts and workflow memories are schemaless at the type level, so
//! they are stored as [`Record`]s: ordered maps from field name to [`Value`].
//! Ordered maps keep serialization stable, which the snapshot etag relies on.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{ser::Error as _, Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Named fields, ordered by key.
pub type Record = BTreeMap<String, Value>;

/// A dynamically typed value.
///
/// # Examples
///
/// ```
/// use waypoint::Value;
///
/// let flag = Value::from(true);
/// let name = Value::from("test02");
///
/// assert!(flag.is_truthy());
/// assert_eq!(name.as_str(), Some("test02"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Float. Must be finite to serialize.
    Float(#[serde(serialize_with = "serialize_finite")] f64),
    /// UTF-8 string.
    String(String),
    /// UUID, kept distinct from strings.
    Uuid(Uuid),
    /// Ordered list.
    List(Vec<Value>),
    /// Nested record.
    Map(Record),
}

/// Non-finite floats have no JSON form.
#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_finite<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        Err(S::Error::custom(format!("non-finite float {value} cannot be serialized")))
    }
}

/// The type of a [`Value`], used by schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Only `Null`.
    Null,
    /// Booleans.
    Bool,
    /// Integers.
    Int,
    /// Floats; ints are accepted too.
    Float,
    /// Strings.
    String,
    /// UUIDs.
    Uuid,
    /// Lists.
    List,
    /// Records.
    Map,
    /// Accepts any value.
    Any,
}

impl ValueKind {
    /// Returns true if `value` conforms to this kind. Ints are accepted as floats.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Float => matches!(value, Value::Float(_) | Value::Int(_)),
            other => other == value.kind(),
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Uuid => "uuid",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        }
    }
}

impl Value {
    /// Returns true for `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the boolean, if this is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the number as a float, widening ints.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the UUID, if this is one.
    pub const fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the list items, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the record, if this is a map.
    pub const fn as_map(&self) -> Option<&Record> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Returns false if this value is, or contains, a NaN or infinite float.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            Self::List(items) => items.iter().all(Self::is_finite),
            Self::Map(fields) => fields.values().all(Self::is_finite),
            _ => true,
        }
    }

    /// Returns the kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Uuid(_) => ValueKind::Uuid,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.kind().name()
    }

    /// Truthiness: null, false, zero and empty containers are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(v) => *v,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::String(v) => !v.is_empty(),
            Self::Uuid(_) => true,
            Self::List(v) => !v.is_empty(),
            Self::Map(v) => !v.is_empty(),
        }
    }

    /// Equality with numeric widening, so `1 == 1.0`.
    #[must_use]
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                self.as_float() == other.as_float()
            }
            _ => self == other,
        }
    }

    /// Orders numbers and strings. Other combinations are unordered.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                self.as_float()?.partial_cmp(&other.as_float()?)
            }
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Membership test: element of a list, key of a map, or substring of a string.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> bool {
        match self {
            Self::List(items) => items.iter().any(|item| item.loose_eq(needle)),
            Self::Map(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
            Self::String(haystack) => needle.as_str().is_some_and(|s| haystack.contains(s)),
            _ => false,
        }
    }

    /// Looks up a nested field of a map value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Self> {
        self.as_map().and_then(|map| map.get(name))
    }
}

/// Resolves a dotted path (`a.b.c`) against a record.
#[must_use]
pub fn lookup_path<'a, S: AsRef<str>>(record: &'a Record, path: &[S]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = record.get(first.as_ref())?;
    for segment in rest {
        current = current.field(segment.as_ref())?;
    }
    Some(current)
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Builds a [`Record`] from `key => value` pairs.
///
/// ```
/// let fact = waypoint::record! { "test01" => "TRUE", "count" => 2 };
/// assert_eq!(fact.len(), 2);
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::Record::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::Record::new();
        $( record.insert(::std::string::String::from($key), $crate::Value::from($value)); )+
        record
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_int() {
        let val = Value::Int(42);
        assert_eq!(val.as_int(), Some(42));
        assert_eq!(val.as_float(), Some(42.0)); // Int can be read as float
        assert_eq!(val.type_name(), "int");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::from("TRUE").is_truthy());
        assert!(Value::from(-1).is_truthy());
    }

    #[test]
    fn test_loose_eq_widens_numbers() {
        assert!(Value::from(1).loose_eq(&Value::from(1.0)));
        assert!(!Value::from(1).loose_eq(&Value::from("1")));
    }

    #[test]
    fn test_compare() {
        assert_eq!(Value::from(1).compare(&Value::from(2.5)), Some(Ordering::Less));
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::from("b").compare(&Value::from(1)), None);
    }

    #[test]
    fn test_contains() {
        let list = Value::from(vec!["a", "b"]);
        assert!(list.contains(&Value::from("a")));
        assert!(!list.contains(&Value::from("c")));
        assert!(Value::from("moonlight").contains(&Value::from("moon")));
    }

    #[test]
    fn test_lookup_path() {
        let inner = record! { "city" => "Hanoi" };
        let rec = record! { "address" => inner, "name" => "x" };
        assert_eq!(
            lookup_path(&rec, &["address", "city"]).and_then(Value::as_str),
            Some("Hanoi")
        );
        assert!(lookup_path(&rec, &["address", "zip"]).is_none());
        assert!(lookup_path::<&str>(&rec, &[]).is_none());
    }

    #[test]
    fn test_value_kind_accepts() {
        assert!(ValueKind::Float.accepts(&Value::from(3)));
        assert!(!ValueKind::Int.accepts(&Value::from(3.0)));
        assert!(ValueKind::Any.accepts(&Value::Null));
    }

    #[test]
    fn test_serde_roundtrip_tagged() {
        let val = Value::from(vec![1, 2]);
        let json = serde_json::to_string(&val).unwrap();
        assert!(json.contains("\"type\":\"list\""));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, val);
    }
}
