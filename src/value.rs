//! Typed configuration values.

use std::fmt;

/// A typed configuration value.
///
/// Every field kind accepts exactly one variant; feeding another variant is a
/// validation failure, not a panic.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    /// Text value.
    Str(String),
    /// Signed integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Raw bytes (files, keys, certificates).
    Bytes(Vec<u8>),
    /// Mailbox as `(display name, address)`; the name may be empty.
    Email {
        /// Display name, possibly empty.
        name: String,
        /// Mail address.
        address: String,
    },
    /// Homogeneous list of values.
    List(Vec<Value>),
}

impl Value {
    /// Short name of the variant, used in type errors.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "integer",
            Self::Bool(_) => "boolean",
            Self::Bytes(_) => "bytes",
            Self::Email { .. } => "email",
            Self::List(_) => "list",
        }
    }

    /// Length for length-bounded validators (chars for text, bytes for binary).
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.chars().count()),
            Self::Bytes(b) => Some(b.len()),
            _ => None,
        }
    }

    /// Borrow as text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Integer content.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean content.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow list items.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Build a list value from anything convertible into values.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Build an email value without a display name.
    #[must_use]
    pub fn email(address: impl Into<String>) -> Self {
        Self::Email {
            name: String::new(),
            address: address.into(),
        }
    }
}

// Debug never prints contents: values may be secrets and Debug output ends
// up in logs and panic messages.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "Str([REDACTED; {} chars])", s.chars().count()),
            Self::Int(_) => write!(f, "Int([REDACTED])"),
            Self::Bool(_) => write!(f, "Bool([REDACTED])"),
            Self::Bytes(b) => write!(f, "Bytes([REDACTED; {} bytes])", b.len()),
            Self::Email { .. } => write!(f, "Email([REDACTED])"),
            Self::List(items) => write!(f, "List([REDACTED; {} items])", items.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

/// Declared default of a field.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum DefaultValue {
    /// No default: an absent value is reported as missing.
    #[default]
    Unset,
    /// Concrete default returned when the value is absent.
    Value(Value),
}

impl DefaultValue {
    /// Borrow the default value if one is declared.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Unset => None,
            Self::Value(v) => Some(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_shows_contents() {
        let v = Value::from("hunter2hunter2");
        let debug = format!("{v:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn byte_vectors_stay_bytes() {
        assert_eq!(Value::from(b"abc".to_vec()), Value::Bytes(b"abc".to_vec()));
        assert_eq!(
            Value::list(["a", "b"]),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn length_counts_chars_for_text() {
        assert_eq!(Value::from("áíő").length(), Some(3));
        assert_eq!(Value::Bytes(vec![0; 4]).length(), Some(4));
        assert_eq!(Value::Int(5).length(), None);
    }
}
