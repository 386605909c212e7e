//! Backend Adapter Layer
//!
//! Every store implements the four record primitives plus schema loading;
//! the orchestrator in `engine::source` supplies hooks, expansion and
//! validation on top.

pub mod airtable;
pub mod json_file;
pub mod rest;

pub use airtable::AirtableBackend;
pub use json_file::JsonFileBackend;
pub use rest::RestBackend;

use async_trait::async_trait;

use super::error::BackendResult;
use super::query::Query;
use super::schema::{FieldValue, Record, RelatedRecord, RelatedRecordCollection, Schema, Table};

/// Core backend trait, implemented by every store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier used in logs
    fn kind(&self) -> &'static str;

    /// Read the schema this backend serves
    async fn load_schema(&self) -> BackendResult<Schema>;

    /// Fetch one record; `None` when the id does not exist
    async fn retrieve(&self, table: &Table, id: &str) -> BackendResult<Option<Record>>;

    /// Fetch the records matching `query`, unexpanded
    async fn query(&self, table: &Table, query: &Query) -> BackendResult<Vec<Record>>;

    /// Create when the record has no id, update otherwise
    async fn save(&self, table: &Table, record: Record) -> BackendResult<Record>;

    async fn delete(&self, table: &Table, id: &str) -> BackendResult<()>;

    /// External collection path of a table
    fn collection_path(&self, table: &Table) -> String {
        format!("/tables/{}", table.name)
    }
}

/// Wrap bare ids stored under foreign key columns as lazy references.
pub fn wrap_references(table: &Table, record: &mut Record) {
    for (column, _, multiple) in table.foreign_keys() {
        let Some(value) = record.get(&column.name) else {
            continue;
        };
        if !matches!(value, FieldValue::Scalar(_)) {
            continue;
        }
        let ids: Vec<String> = value.reference_ids().into_iter().map(String::from).collect();
        let wrapped = if multiple || column.is_read_only() {
            FieldValue::Collection(RelatedRecordCollection::from_ids(ids))
        } else {
            match ids.into_iter().next() {
                Some(id) => FieldValue::Related(RelatedRecord::new(id)),
                None => FieldValue::null(),
            }
        };
        record.insert(&column.name, wrapped);
    }
}

/// Collapse references to bare ids (or id lists) for storage.
pub fn unwrap_references(table: &Table, record: &Record) -> serde_json::Map<String, serde_json::Value> {
    record
        .iter()
        .map(|(field, value)| {
            let plain = match table.column(field) {
                Some(column) => match table.foreign_keys().find(|(c, _, _)| c.name == column.name) {
                    Some((_, _, true)) => serde_json::Value::Array(
                        value
                            .reference_ids()
                            .into_iter()
                            .map(|id| serde_json::Value::String(id.to_string()))
                            .collect(),
                    ),
                    _ => value.to_plain_json(),
                },
                None => value.to_plain_json(),
            };
            (field.clone(), plain)
        })
        .collect()
}
