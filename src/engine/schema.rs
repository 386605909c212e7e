//! Schema and record model
//!
//! Tables and columns describe every backend uniformly; records are maps of
//! column name to scalar values or weak references into other tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::error::{EngineError, Result};

/// Pseudo-column holding the record identifier.
pub const ID_FIELD: &str = "id";

/// A set of tables served by one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    /// Look a table up by id, falling back to its name.
    pub fn table(&self, name_or_id: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.id == name_or_id)
            .or_else(|| self.tables.iter().find(|t| t.name == name_or_id))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Check column uniqueness and foreign key targets.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            let mut seen = HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.as_str()) {
                    return Err(EngineError::Schema(format!(
                        "Duplicate column '{}' in table '{}'",
                        column.name, table.name
                    )));
                }
                if let ColumnType::ForeignKey { foreign_table_id, .. } = &column.column_type {
                    if self.table(foreign_table_id).is_none() {
                        return Err(EngineError::Schema(format!(
                            "Column '{}.{}' references unknown table '{}'",
                            table.name, column.name, foreign_table_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Table definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Stable internal key
    pub id: String,
    /// External/display key
    pub name: String,
    #[serde(default)]
    pub label: String,
    /// Column supplying the display name of references to this table
    pub name_field: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_view: Option<String>,
}

impl Table {
    pub fn new(id: &str, name: &str, name_field: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            label: name.to_string(),
            name_field: name_field.to_string(),
            columns: Vec::new(),
            default_view: None,
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True when `name_or_id` designates this table.
    pub fn is(&self, name_or_id: &str) -> bool {
        self.id == name_or_id || self.name == name_or_id
    }

    /// Columns holding references into other tables, with their targets.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&Column, &str, bool)> {
        self.columns.iter().filter_map(|c| match c.column_type.concrete() {
            ColumnType::ForeignKey {
                foreign_table_id,
                multiple,
            } => Some((c, foreign_table_id.as_str(), *multiple)),
            _ => None,
        })
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_control_props: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub novalidate: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            column_type,
            default_control_props: None,
            novalidate: false,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text { long: false })
    }

    pub fn number(name: &str) -> Self {
        Self::new(name, ColumnType::Number { precision: None })
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn datetime(name: &str) -> Self {
        Self::new(name, ColumnType::DateTime { date_only: false })
    }

    pub fn select(name: &str, options: &[&str]) -> Self {
        Self::new(
            name,
            ColumnType::Select {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
        )
    }

    pub fn foreign_key(name: &str, foreign_table_id: &str, multiple: bool) -> Self {
        Self::new(
            name,
            ColumnType::ForeignKey {
                foreign_table_id: foreign_table_id.to_string(),
                multiple,
            },
        )
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.column_type, ColumnType::ReadOnly { .. })
    }
}

/// Column type with type-specific properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties", rename_all_fields = "camelCase")]
pub enum ColumnType {
    Text {
        #[serde(default)]
        long: bool,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precision: Option<u32>,
    },
    Select {
        #[serde(default)]
        options: Vec<String>,
    },
    MultiSelect {
        #[serde(default)]
        options: Vec<String>,
    },
    Boolean,
    DateTime {
        #[serde(default)]
        date_only: bool,
    },
    ForeignKey {
        foreign_table_id: String,
        #[serde(default)]
        multiple: bool,
    },
    /// Derived value; `of` describes the shape of what is computed.
    ReadOnly { of: Box<ColumnType> },
}

impl ColumnType {
    /// Strip any read-only wrappers.
    pub fn concrete(&self) -> &ColumnType {
        match self {
            ColumnType::ReadOnly { of } => of.concrete(),
            other => other,
        }
    }

    pub fn read_only(of: ColumnType) -> Self {
        match of {
            ColumnType::ReadOnly { .. } => of,
            other => ColumnType::ReadOnly { of: Box::new(other) },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordTag {
    #[default]
    #[serde(rename = "record")]
    Record,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionTag {
    #[default]
    #[serde(rename = "record-collection")]
    RecordCollection,
}

/// Weak reference to a record of another table.
///
/// `name` and `record` are a cached projection filled in by expansion; an
/// unexpanded reference carries only the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedRecord {
    #[serde(rename = "type")]
    tag: RecordTag,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Box<Record>>,
}

impl RelatedRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            tag: RecordTag::Record,
            id: id.into(),
            name: None,
            record: None,
        }
    }

    pub fn is_expanded(&self) -> bool {
        self.name.as_deref().map(|n| !n.is_empty()).unwrap_or(false)
    }

    /// Same reference with the cached projection filled in.
    pub fn expanded_with(&self, name: String, record: Record) -> Self {
        let mut reference = self.clone();
        reference.name = Some(name);
        reference.record = Some(Box::new(record));
        reference
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedRecordCollection {
    #[serde(rename = "type")]
    tag: CollectionTag,
    pub records: Vec<RelatedRecord>,
}

impl RelatedRecordCollection {
    pub fn new(records: Vec<RelatedRecord>) -> Self {
        Self {
            tag: CollectionTag::RecordCollection,
            records,
        }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ids.into_iter().map(RelatedRecord::new).collect())
    }
}

/// Value stored under one column of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Related(RelatedRecord),
    Collection(RelatedRecordCollection),
    Scalar(Value),
}

impl FieldValue {
    pub fn null() -> Self {
        FieldValue::Scalar(Value::Null)
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(Value::as_str)
    }

    /// Null, empty string, empty list and empty collection all count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Scalar(Value::Null) => true,
            FieldValue::Scalar(Value::String(s)) => s.is_empty(),
            FieldValue::Scalar(Value::Array(a)) => a.is_empty(),
            FieldValue::Scalar(_) => false,
            FieldValue::Related(r) => r.id.is_empty(),
            FieldValue::Collection(c) => c.records.is_empty(),
        }
    }

    /// Referenced ids, accepting bare id strings and id arrays too.
    pub fn reference_ids(&self) -> Vec<&str> {
        match self {
            FieldValue::Related(r) => vec![r.id.as_str()],
            FieldValue::Collection(c) => c.records.iter().map(|r| r.id.as_str()).collect(),
            FieldValue::Scalar(Value::String(s)) if !s.is_empty() => vec![s.as_str()],
            FieldValue::Scalar(Value::Array(items)) => {
                items.iter().filter_map(Value::as_str).collect()
            }
            FieldValue::Scalar(_) => Vec::new(),
        }
    }

    /// Plain JSON form: references collapse to their ids.
    pub fn to_plain_json(&self) -> Value {
        match self {
            FieldValue::Scalar(v) => v.clone(),
            FieldValue::Related(r) => Value::String(r.id.clone()),
            FieldValue::Collection(c) => {
                Value::Array(c.records.iter().map(|r| Value::String(r.id.clone())).collect())
            }
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Scalar(Value::String(value.to_string()))
    }
}

impl From<RelatedRecord> for FieldValue {
    fn from(value: RelatedRecord) -> Self {
        FieldValue::Related(value)
    }
}

impl From<RelatedRecordCollection> for FieldValue {
    fn from(value: RelatedRecordCollection) -> Self {
        FieldValue::Collection(value)
    }
}

/// A record: column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, FieldValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object; anything else yields `None`.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(
                map.into_iter().map(|(k, v)| (k, FieldValue::Scalar(v))).collect(),
            )),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(FieldValue::as_str).filter(|s| !s.is_empty())
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0
            .insert(ID_FIELD.to_string(), FieldValue::Scalar(Value::String(id.into())));
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut FieldValue> {
        self.0.get_mut(field)
    }

    pub fn insert(&mut self, field: &str, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.0.insert(field.to_string(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut FieldValue)> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Old fields overlaid with `patch`; patch values win.
    pub fn merge(mut self, patch: Record) -> Record {
        self.0.extend(patch.0);
        self
    }

    /// Human-readable value of `field`, used as a reference's display name.
    pub fn display_value(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            FieldValue::Scalar(Value::String(s)) => Some(s.clone()),
            FieldValue::Scalar(Value::Null) => None,
            FieldValue::Scalar(other) => Some(other.to_string()),
            FieldValue::Related(r) => r.name.clone().or_else(|| Some(r.id.clone())),
            FieldValue::Collection(c) => Some(
                c.records
                    .iter()
                    .map(|r| r.name.clone().unwrap_or_else(|| r.id.clone()))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Table annotated with its external collection path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescription {
    #[serde(flatten)]
    pub table: Table,
    pub collection: String,
}

/// Schema as published by the introspection endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescription>,
}

impl SchemaDescription {
    pub fn into_schema(self) -> Schema {
        Schema::new(self.tables.into_iter().map(|t| t.table).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn library() -> Schema {
        Schema::new(vec![
            Table::new("tbl_authors", "authors", "name").with_column(Column::text("name")),
            Table::new("tbl_books", "books", "title")
                .with_column(Column::text("title"))
                .with_column(Column::foreign_key("author", "tbl_authors", false)),
        ])
    }

    #[test]
    fn test_table_lookup_by_id_or_name() {
        let schema = library();
        assert_eq!(schema.table("tbl_books").unwrap().name, "books");
        assert_eq!(schema.table("authors").unwrap().id, "tbl_authors");
        assert!(schema.table("missing").is_none());
    }

    #[test]
    fn test_schema_validation() {
        assert!(library().validate().is_ok());

        let dup = Schema::new(vec![Table::new("t", "t", "a")
            .with_column(Column::text("a"))
            .with_column(Column::number("a"))]);
        assert!(matches!(dup.validate(), Err(EngineError::Schema(_))));

        let dangling = Schema::new(vec![
            Table::new("t", "t", "a").with_column(Column::foreign_key("b", "nowhere", false))
        ]);
        assert!(dangling.validate().is_err());
    }

    #[test]
    fn test_column_serialization_shape() {
        let col = Column::foreign_key("author", "tbl_authors", true);
        let value = serde_json::to_value(&col).unwrap();
        assert_eq!(value["type"], "ForeignKey");
        assert_eq!(value["properties"]["foreignTableId"], "tbl_authors");
        assert_eq!(value["properties"]["multiple"], true);

        let parsed: Column = serde_json::from_value(json!({
            "name": "done",
            "label": "Done",
            "type": "Boolean"
        }))
        .unwrap();
        assert_eq!(parsed.column_type, ColumnType::Boolean);
    }

    #[test]
    fn test_field_value_reference_parsing() {
        let record: Record = serde_json::from_value(json!({
            "id": "rec1",
            "author": {"type": "record", "id": "a1"},
            "tags": {"type": "record-collection", "records": [{"type": "record", "id": "t1"}]},
            "title": "Dune"
        }))
        .unwrap();

        assert_eq!(record.id(), Some("rec1"));
        assert!(matches!(record.get("author"), Some(FieldValue::Related(r)) if r.id == "a1"));
        assert!(matches!(record.get("tags"), Some(FieldValue::Collection(c)) if c.records.len() == 1));
        assert_eq!(record.get("title").and_then(FieldValue::as_str), Some("Dune"));
    }

    #[test]
    fn test_expanded_reference_keeps_tag() {
        let reference = RelatedRecord::new("a1");
        assert!(!reference.is_expanded());

        let target = Record::new().with("id", "a1").with("name", "Frank Herbert");
        let expanded = reference.expanded_with("Frank Herbert".to_string(), target);
        assert!(expanded.is_expanded());
        assert_eq!(expanded.id, "a1");

        let value = serde_json::to_value(&expanded).unwrap();
        assert_eq!(value["type"], "record");
        assert_eq!(value["name"], "Frank Herbert");
        assert_eq!(value["record"]["name"], "Frank Herbert");
    }

    #[test]
    fn test_merge_new_wins() {
        let old = Record::new().with("a", json!(1)).with("b", json!(2));
        let merged = old.merge(Record::new().with("b", json!(3)));
        assert_eq!(merged.get("a"), Some(&FieldValue::Scalar(json!(1))));
        assert_eq!(merged.get("b"), Some(&FieldValue::Scalar(json!(3))));
    }

    #[test]
    fn test_empty_values() {
        assert!(FieldValue::null().is_empty());
        assert!(FieldValue::from("").is_empty());
        assert!(FieldValue::from(RelatedRecordCollection::new(vec![])).is_empty());
        assert!(!FieldValue::from(json!(0)).is_empty());
    }
}
