//! Document store adapter: schemaless JSON records in three collections.

mod filter;
mod wal_store;

pub use filter::Filter;
pub use wal_store::WalStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use ulid::Ulid;

use crate::model::Collection;

/// A stored record. Every document carries its id under [`ID_FIELD`].
pub type Document = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "id";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("document encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Equality-filter CRUD over the three collections. No multi-document
/// atomicity: callers that need it serialize their own read-then-write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a record and return its generated id. Any `id` already in the
    /// record is replaced.
    async fn insert(&self, collection: Collection, doc: Document) -> Result<Ulid, StoreError>;

    /// First matching record in insertion order.
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;

    /// All matching records in insertion order.
    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document>, StoreError>;

    /// Merge `fields` into the first matching record. Returns the number of
    /// records written (0 or 1). The id field is never changed.
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Document,
    ) -> Result<u64, StoreError>;

    /// Delete the first matching record. Returns the number deleted (0 or 1).
    async fn delete_one(&self, collection: Collection, filter: &Filter)
    -> Result<u64, StoreError>;
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Encoding(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        )))),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Build an update document from `(field, value)` pairs.
pub fn fields<I, V>(pairs: I) -> Result<Document, StoreError>
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Serialize,
{
    pairs
        .into_iter()
        .map(|(k, v)| -> Result<(String, Value), StoreError> {
            Ok((k.to_string(), serde_json::to_value(v)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: Ulid,
        n: u32,
    }

    #[test]
    fn document_roundtrip() {
        let row = Row { id: Ulid::new(), n: 3 };
        let doc = to_document(&row).unwrap();
        assert_eq!(doc.get(ID_FIELD), Some(&Value::String(row.id.to_string())));
        let back: Row = from_document(doc).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn non_object_rejected() {
        assert!(matches!(to_document(&5u32), Err(StoreError::Encoding(_))));
    }

    #[test]
    fn fields_builds_partial_document() {
        let doc = fields([("capacity", 4)]).unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc["capacity"], Value::from(4));
    }
}
