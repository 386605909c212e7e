//! Record mapping between AirTable and the engine

use serde_json::{Map, Value};
use tracing::debug;

use super::client::AirtableRecord;
use crate::engine::adapter::wrap_references;
use crate::engine::schema::{ColumnType, FieldValue, Record, Table, ID_FIELD};

/// Engine record from an API record. Links become unexpanded references.
pub fn to_record(table: &Table, source: AirtableRecord) -> Record {
    let mut record: Record = source
        .fields
        .into_iter()
        .map(|(field, value)| (field, FieldValue::Scalar(value)))
        .collect();
    record.set_id(source.id);

    // unchecked checkboxes are omitted by the API
    for column in &table.columns {
        if column.column_type == ColumnType::Boolean && !record.contains(&column.name) {
            record.insert(&column.name, Value::Bool(false));
        }
    }

    wrap_references(table, &mut record);
    record
}

/// Writable fields of `record` in the shape the write API expects.
pub fn to_fields(table: &Table, record: &Record) -> Map<String, Value> {
    let mut fields = Map::new();
    for (name, value) in record.iter() {
        if name == ID_FIELD {
            continue;
        }
        let Some(column) = table.column(name) else {
            debug!(table = %table.name, field = %name, "dropping unknown field");
            continue;
        };
        let plain = match &column.column_type {
            ColumnType::ReadOnly { .. } => continue,
            ColumnType::ForeignKey { .. } => Value::Array(
                value
                    .reference_ids()
                    .into_iter()
                    .map(|id| Value::String(id.to_string()))
                    .collect(),
            ),
            _ => value.to_plain_json(),
        };
        fields.insert(name.clone(), plain);
    }
    fields
}
