//! Declared event fields and whether they are scalar or jagged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Shape of a field within one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Exactly one value per record.
    Scalar,
    /// A variable number of values per record.
    Jagged,
}

/// Field names known to the engine, keyed by name.
///
/// Deserializes from a plain JSON object, e.g. `{"mu": "scalar", "tau_pt": "jagged"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a scalar field.
    pub fn scalar(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldKind::Scalar);
        self
    }

    /// Declare a jagged field.
    pub fn jagged(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldKind::Jagged);
        self
    }

    /// Declare a field of the given kind, replacing any previous declaration.
    pub fn insert(&mut self, name: impl Into<String>, kind: FieldKind) {
        self.fields.insert(name.into(), kind);
    }

    /// Kind of `name`, if declared.
    pub fn kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).copied()
    }

    /// `true` if `name` is declared jagged.
    pub fn is_jagged(&self, name: &str) -> bool {
        self.kind(name) == Some(FieldKind::Jagged)
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `true` if no fields are declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate `(name, kind)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_lookup() {
        let s = Schema::new().scalar("mu").jagged("tau_pt");
        assert_eq!(s.kind("mu"), Some(FieldKind::Scalar));
        assert!(s.is_jagged("tau_pt"));
        assert_eq!(s.kind("nope"), None);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn deserialize_from_object() {
        let s: Schema = serde_json::from_str(r#"{"mu": "scalar", "tau_pt": "jagged"}"#).unwrap();
        assert_eq!(s, Schema::new().scalar("mu").jagged("tau_pt"));
    }
}
