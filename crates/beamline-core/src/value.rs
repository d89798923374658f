//! Scalar values carried by process variables.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, BeamlineError};

/// Native type of a process variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Double,
    Long,
    Text,
}

/// A scalar PV value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    Long(i64),
    Double(f64),
    Text(String),
}

impl PvValue {
    /// Zero value of the given kind, used when a PV is first served.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Double => PvValue::Double(0.0),
            ValueKind::Long => PvValue::Long(0),
            ValueKind::Text => PvValue::Text(String::new()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            PvValue::Double(_) => ValueKind::Double,
            PvValue::Long(_) => ValueKind::Long,
            PvValue::Text(_) => ValueKind::Text,
        }
    }

    /// Numeric view of the value. Text parses as a number when it can.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Double(v) => Some(*v),
            PvValue::Long(v) => Some(*v as f64),
            PvValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value or a `TypeMismatch` naming the PV.
    pub fn expect_f64(&self, name: &str) -> AppResult<f64> {
        self.as_f64().ok_or_else(|| BeamlineError::TypeMismatch {
            name: name.to_string(),
            expected: "number",
            actual: self.to_string(),
        })
    }

    /// Coerce into `kind`, as an IOC does when a client puts a value of a
    /// different native type.
    pub fn coerce(self, kind: ValueKind) -> Self {
        match (kind, self) {
            (ValueKind::Double, PvValue::Long(v)) => PvValue::Double(v as f64),
            (ValueKind::Long, PvValue::Double(v)) => PvValue::Long(v.round() as i64),
            (ValueKind::Text, other @ (PvValue::Double(_) | PvValue::Long(_))) => {
                PvValue::Text(other.to_string())
            }
            (ValueKind::Double, PvValue::Text(s)) => match s.trim().parse::<f64>() {
                Ok(v) => PvValue::Double(v),
                Err(_) => PvValue::Text(s),
            },
            (ValueKind::Long, PvValue::Text(s)) => match s.trim().parse::<i64>() {
                Ok(v) => PvValue::Long(v),
                Err(_) => PvValue::Text(s),
            },
            (_, v) => v,
        }
    }

    /// True for empty text or a numeric zero.
    pub fn is_empty(&self) -> bool {
        match self {
            PvValue::Text(s) => s.is_empty(),
            PvValue::Double(v) => *v == 0.0,
            PvValue::Long(v) => *v == 0,
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Double(v) => write!(f, "{}", v),
            PvValue::Long(v) => write!(f, "{}", v),
            PvValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Double(v)
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Long(v)
    }
}

impl From<i32> for PvValue {
    fn from(v: i32) -> Self {
        PvValue::Long(v as i64)
    }
}

impl From<usize> for PvValue {
    fn from(v: usize) -> Self {
        PvValue::Long(v as i64)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Text(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Text(v)
    }
}

impl From<PvValue> for serde_json::Value {
    fn from(v: PvValue) -> Self {
        match v {
            PvValue::Double(d) => serde_json::json!(d),
            PvValue::Long(l) => serde_json::json!(l),
            PvValue::Text(s) => serde_json::Value::String(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_follows_native_kind() {
        assert_eq!(PvValue::from(3).coerce(ValueKind::Double), PvValue::Double(3.0));
        assert_eq!(PvValue::from(2.6).coerce(ValueKind::Long), PvValue::Long(3));
        assert_eq!(
            PvValue::from(2000).coerce(ValueKind::Text),
            PvValue::Text("2000".into())
        );
        assert_eq!(PvValue::from("Auto").coerce(ValueKind::Long), PvValue::Text("Auto".into()));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(PvValue::from(" 1.5 ").as_f64(), Some(1.5));
        assert!(PvValue::from("abc").expect_f64("x").is_err());
        assert!(PvValue::from("").is_empty());
        assert!(!PvValue::from("I0").is_empty());
    }
}
