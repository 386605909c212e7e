//! AirTable field conversion
//!
//! Lookup fields are resolved by following their link field into the linked
//! table until a concrete field is reached. A visited set bounds the walk;
//! a chain that loops back on itself degrades to read-only text.

use std::collections::HashSet;
use tracing::warn;

use super::client::{FieldOptions, MetaField, MetaTable};
use crate::engine::schema::{Column, ColumnType, Schema, Table};

pub fn convert_schema(tables: &[MetaTable]) -> Schema {
    Schema::new(tables.iter().map(|t| convert_table(tables, t)).collect())
}

fn convert_table(tables: &[MetaTable], table: &MetaTable) -> Table {
    let name_field = table
        .field(&table.primary_field_id)
        .map(|f| f.name.clone())
        .unwrap_or_default();

    let mut converted = Table::new(&table.id, &table.name, &name_field);
    converted.default_view = table.views.first().map(|v| v.name.clone());
    converted.columns = table
        .fields
        .iter()
        .map(|field| {
            let mut visited = HashSet::new();
            Column::new(
                &field.name,
                convert_field(tables, table, field, &mut visited),
            )
        })
        .collect();
    converted
}

fn convert_field(
    tables: &[MetaTable],
    table: &MetaTable,
    field: &MetaField,
    visited: &mut HashSet<(String, String)>,
) -> ColumnType {
    match field.field_type.as_str() {
        "multipleLookupValues" | "lookup" => resolve_lookup(tables, table, field, visited),
        kind => convert_kind(kind, &field.options),
    }
}

/// Conversion of every kind that needs no other field to resolve.
fn convert_kind(kind: &str, options: &FieldOptions) -> ColumnType {
    match kind {
        "singleLineText" | "email" | "url" | "phoneNumber" | "barcode" => {
            ColumnType::Text { long: false }
        }
        "multilineText" | "richText" => ColumnType::Text { long: true },
        "number" | "currency" | "percent" | "rating" | "duration" => ColumnType::Number {
            precision: options.precision,
        },
        "checkbox" => ColumnType::Boolean,
        "date" => ColumnType::DateTime { date_only: true },
        "dateTime" => ColumnType::DateTime { date_only: false },
        "singleSelect" => ColumnType::Select {
            options: options.choices.iter().map(|c| c.name.clone()).collect(),
        },
        "multipleSelects" => ColumnType::MultiSelect {
            options: options.choices.iter().map(|c| c.name.clone()).collect(),
        },
        "multipleRecordLinks" => match &options.linked_table_id {
            Some(linked) => ColumnType::ForeignKey {
                foreign_table_id: linked.clone(),
                multiple: !options.prefers_single_record_link,
            },
            None => ColumnType::read_only(ColumnType::Text { long: false }),
        },
        "autoNumber" | "count" => ColumnType::read_only(ColumnType::Number { precision: None }),
        "createdTime" | "lastModifiedTime" => {
            ColumnType::read_only(ColumnType::DateTime { date_only: false })
        }
        "formula" | "rollup" => ColumnType::read_only(result_type(options)),
        "createdBy" | "lastModifiedBy" | "button" | "externalSyncSource" | "aiText" => {
            ColumnType::read_only(ColumnType::Text { long: false })
        }
        _ => ColumnType::Text { long: false },
    }
}

fn result_type(options: &FieldOptions) -> ColumnType {
    match &options.result {
        Some(result) => convert_kind(&result.field_type, &result.options).concrete().clone(),
        None => ColumnType::Text { long: false },
    }
}

fn resolve_lookup(
    tables: &[MetaTable],
    table: &MetaTable,
    field: &MetaField,
    visited: &mut HashSet<(String, String)>,
) -> ColumnType {
    if !visited.insert((table.id.clone(), field.id.clone())) {
        warn!(table = %table.name, field = %field.name, "lookup chain loops back on itself");
        return ColumnType::read_only(ColumnType::Text { long: false });
    }

    let target = field
        .options
        .record_link_field_id
        .as_deref()
        .and_then(|id| table.field(id))
        .and_then(|link| link.options.linked_table_id.as_deref())
        .and_then(|linked_id| tables.iter().find(|t| t.id == linked_id))
        .and_then(|linked| {
            field
                .options
                .field_id_in_linked_table
                .as_deref()
                .and_then(|id| linked.field(id))
                .map(|target| (linked, target))
        });

    match target {
        Some((linked, target)) => {
            let resolved = convert_field(tables, linked, target, visited);
            ColumnType::read_only(resolved.concrete().clone())
        }
        None => ColumnType::read_only(result_type(&field.options)),
    }
}
