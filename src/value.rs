//! Tagged-variant expression value type.
//!
//! Preferred over a direct `serde_json::Value` reuse (Design Note, SPEC_FULL.md
//! §9) because HCL distinguishes tuples from objects and needs an explicit
//! `Unknown` variant for deferred/marked values that `serde_json` has no slot
//! for. Marks propagate through any operation that touches a marked value,
//! mirroring how a single `sensitive = true` taints an entire derived
//! expression tree.

use std::collections::BTreeSet;
use std::fmt;

use rustc_hash::FxHashMap;

/// A single mark tag (e.g. `"sensitive"`). Kept as an interned-free `String`
/// since mark sets are small and short-lived.
pub type Mark = String;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkSet(BTreeSet<Mark>);

impl MarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(mark: impl Into<Mark>) -> Self {
        let mut set = BTreeSet::new();
        set.insert(mark.into());
        Self(set)
    }

    pub fn union(&self, other: &MarkSet) -> MarkSet {
        MarkSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, mark: &str) -> bool {
        self.0.contains(mark)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Tuple(Vec<Value>),
    Object(FxHashMap<String, Value>),
    /// A value whose concrete contents are not known yet (e.g. a computed
    /// dependency output before apply). Distinct from `Null`.
    Unknown,
    /// Wraps any other variant while carrying marks (e.g. `sensitive`).
    Marked(Box<Value>, MarkSet),
}

impl Value {
    pub fn is_unknown(&self) -> bool {
        matches!(self.unwrap_marks(), Value::Unknown)
    }

    pub fn is_truthy(&self) -> bool {
        match self.unwrap_marks() {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Unknown => false,
            Value::Marked(..) => unreachable!("unwrap_marks strips Marked"),
        }
    }

    /// Strip any `Marked` wrapper, returning the innermost value.
    pub fn unwrap_marks(&self) -> &Value {
        match self {
            Value::Marked(inner, _) => inner.unwrap_marks(),
            other => other,
        }
    }

    /// Collect the union of all marks applied anywhere in this value's wrapper chain.
    pub fn marks(&self) -> MarkSet {
        match self {
            Value::Marked(inner, marks) => marks.union(&inner.marks()),
            _ => MarkSet::new(),
        }
    }

    pub fn mark(self, mark: impl Into<Mark>) -> Value {
        Value::Marked(Box::new(self), MarkSet::single(mark))
    }

    pub fn type_name(&self) -> &'static str {
        match self.unwrap_marks() {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::Object(_) => "object",
            Value::Unknown => "unknown",
            Value::Marked(..) => unreachable!(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unwrap_marks() {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&FxHashMap<String, Value>> {
        match self.unwrap_marks() {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Convert to `serde_json::Value` for interop with the engine's
    /// JSON-based plan/state output and the CLI's `render` subcommand.
    /// Marks are dropped; `Unknown` becomes JSON null with no way to
    /// distinguish it, which is acceptable for display/debug purposes only.
    pub fn to_json(&self) -> serde_json::Value {
        match self.unwrap_marks() {
            Value::Null | Value::Unknown => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Tuple(t) => serde_json::Value::Array(t.iter().map(Value::to_json).collect()),
            Value::Object(o) => {
                serde_json::Value::Object(o.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            Value::Marked(..) => unreachable!(),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(a) => Value::Tuple(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => Value::Object(
                o.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unwrap_marks() {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Unknown => write!(f, "(known after apply)"),
            Value::Tuple(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
            Value::Marked(..) => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_hcl_semantics() {
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(Value::String("x".into()).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::Unknown.is_truthy());
    }

    #[test]
    fn marks_propagate_through_wrapping() {
        let v = Value::String("secret".into()).mark("sensitive");
        assert!(v.marks().contains("sensitive"));
        assert_eq!(v.unwrap_marks().as_str(), Some("secret"));
    }

    #[test]
    fn double_marking_unions() {
        let v = Value::Number(1.0).mark("sensitive").mark("ephemeral");
        let marks = v.marks();
        assert!(marks.contains("sensitive"));
        assert!(marks.contains("ephemeral"));
    }

    #[test]
    fn json_roundtrip_preserves_structure() {
        let json = serde_json::json!({"a": [1, 2, "x"], "b": null});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn unknown_is_distinct_from_null() {
        assert!(Value::Unknown.is_unknown());
        assert!(!Value::Null.is_unknown());
    }
}
