use serde::Serialize;
use serde_json::Value;
use ulid::Ulid;

use super::{Document, ID_FIELD};

/// Conjunction of top-level equality predicates. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: Ulid) -> Self {
        Self::new().eq(ID_FIELD, id.to_string())
    }

    /// Add `field == value`. Values that fail to serialize never match.
    pub fn eq(mut self, field: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.terms.push((field.to_string(), value));
        self
    }

    /// The id this filter pins, if it is exactly an id lookup.
    pub fn id(&self) -> Option<Ulid> {
        match self.terms.as_slice() {
            [(field, Value::String(s))] if field == ID_FIELD => s.parse().ok(),
            _ => None,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.terms
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }
}
