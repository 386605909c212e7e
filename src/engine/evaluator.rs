//! In-memory condition evaluation
//!
//! Matches records against condition trees with the same semantics the
//! backend query compilers target: case-insensitive text, numeric or date
//! ordering by column type, and reference comparisons by id.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

use super::query::{Condition, GroupKind, Operator, SingleCondition};
use super::schema::{Column, ColumnType, FieldValue, Record, Table, ID_FIELD};

const TEXT_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::Contains,
    Operator::Ncontains,
    Operator::Notnull,
    Operator::Null,
];

const ORDERED_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::Gt,
    Operator::Lt,
    Operator::Gte,
    Operator::Lte,
    Operator::Notnull,
    Operator::Null,
];

const IDENTITY_OPS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::Notnull,
    Operator::Null,
];

/// Operators that make sense for a column type.
pub fn valid_operators_for(column: &Column) -> &'static [Operator] {
    operators_for_type(&column.column_type)
}

pub fn operators_for_type(column_type: &ColumnType) -> &'static [Operator] {
    match column_type {
        ColumnType::Text { .. } | ColumnType::Select { .. } | ColumnType::MultiSelect { .. } => {
            TEXT_OPS
        }
        ColumnType::Number { .. } | ColumnType::DateTime { .. } => ORDERED_OPS,
        ColumnType::Boolean | ColumnType::ForeignKey { .. } => IDENTITY_OPS,
        ColumnType::ReadOnly { of } => operators_for_type(of),
    }
}

/// Check whether `record` satisfies `condition`.
pub fn matches(table: &Table, record: &Record, condition: &Condition) -> bool {
    match condition {
        Condition::Single(leaf) => matches_leaf(table, record, leaf),
        Condition::Group(group) => match group.kind {
            GroupKind::And => group.conditions.iter().all(|c| matches(table, record, c)),
            GroupKind::Or => group.conditions.iter().any(|c| matches(table, record, c)),
        },
    }
}

/// How a field's values are compared
#[derive(Debug, Clone, Copy, PartialEq)]
enum Semantics {
    Text,
    Number,
    Date,
    Boolean,
    Identity,
    Untyped,
}

fn semantics_of(column_type: &ColumnType) -> Semantics {
    match column_type.concrete() {
        ColumnType::Text { .. } | ColumnType::Select { .. } | ColumnType::MultiSelect { .. } => {
            Semantics::Text
        }
        ColumnType::Number { .. } => Semantics::Number,
        ColumnType::DateTime { .. } => Semantics::Date,
        ColumnType::Boolean => Semantics::Boolean,
        _ => Semantics::Identity,
    }
}

fn matches_leaf(table: &Table, record: &Record, leaf: &SingleCondition) -> bool {
    let (semantics, values) = if leaf.field == ID_FIELD && table.column(ID_FIELD).is_none() {
        let id = record.id().map(|s| Value::String(s.to_string()));
        (Semantics::Identity, id.into_iter().collect::<Vec<_>>())
    } else {
        let semantics = match table.column(&leaf.field) {
            Some(column) => {
                if !valid_operators_for(column).contains(&leaf.operator) {
                    return false;
                }
                semantics_of(&column.column_type)
            }
            None => Semantics::Untyped,
        };
        (semantics, comparable_values(record.get(&leaf.field)))
    };

    match leaf.operator {
        Operator::Null => values.iter().all(is_blank),
        Operator::Notnull => !values.iter().all(is_blank),
        Operator::Eq => values.iter().any(|v| equals(semantics, v, &leaf.value)),
        Operator::Neq => !values.iter().any(|v| equals(semantics, v, &leaf.value)),
        Operator::Contains => contains(&values, &leaf.value).unwrap_or(false),
        Operator::Ncontains => contains(&values, &leaf.value).map(|c| !c).unwrap_or(false),
        Operator::Gt => ordered(semantics, &values, &leaf.value, |o| o == Ordering::Greater),
        Operator::Lt => ordered(semantics, &values, &leaf.value, |o| o == Ordering::Less),
        Operator::Gte => ordered(semantics, &values, &leaf.value, |o| o != Ordering::Less),
        Operator::Lte => ordered(semantics, &values, &leaf.value, |o| o != Ordering::Greater),
    }
}

/// Flatten a field into the scalar values comparisons act on.
fn comparable_values(value: Option<&FieldValue>) -> Vec<Value> {
    match value {
        None => Vec::new(),
        Some(FieldValue::Related(r)) => vec![Value::String(r.id.clone())],
        Some(FieldValue::Collection(c)) => {
            c.records.iter().map(|r| Value::String(r.id.clone())).collect()
        }
        Some(FieldValue::Scalar(Value::Array(items))) => items.clone(),
        Some(FieldValue::Scalar(v)) => vec![v.clone()],
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn equals(semantics: Semantics, actual: &Value, expected: &Value) -> bool {
    match semantics {
        Semantics::Text => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.to_lowercase() == e.to_lowercase(),
            _ => actual == expected,
        },
        Semantics::Number => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(e)) => a == e,
            _ => false,
        },
        Semantics::Date => match (as_timestamp(actual), as_timestamp(expected)) {
            (Some(a), Some(e)) => a == e,
            _ => actual == expected,
        },
        Semantics::Boolean => match (as_bool(actual), as_bool(expected)) {
            (Some(a), Some(e)) => a == e,
            _ => false,
        },
        Semantics::Identity => actual == expected,
        Semantics::Untyped => {
            actual == expected
                || matches!((actual.as_str(), expected.as_str()),
                    (Some(a), Some(e)) if a.to_lowercase() == e.to_lowercase())
        }
    }
}

/// `None` when either side is not a string.
fn contains(values: &[Value], needle: &Value) -> Option<bool> {
    let needle = needle.as_str()?.to_lowercase();
    let mut found = false;
    let mut any_string = false;
    for value in values {
        if let Some(s) = value.as_str() {
            any_string = true;
            found |= s.to_lowercase().contains(&needle);
        }
    }
    any_string.then_some(found)
}

fn ordered(
    semantics: Semantics,
    values: &[Value],
    expected: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    values
        .iter()
        .filter_map(|v| compare_scalars(semantics, v, expected))
        .any(accept)
}

fn compare_scalars(semantics: Semantics, a: &Value, b: &Value) -> Option<Ordering> {
    match semantics {
        Semantics::Number => as_number(a)?.partial_cmp(&as_number(b)?),
        Semantics::Date => Some(as_timestamp(a)?.cmp(&as_timestamp(b)?)),
        Semantics::Untyped => match (a, b) {
            (Value::Number(_), Value::Number(_)) => as_number(a)?.partial_cmp(&as_number(b)?),
            _ => None,
        },
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Accepts RFC 3339 timestamps, naive date-times and plain dates.
pub fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Ordering of two records on `field`, missing values last.
pub fn compare_field(table: &Table, field: &str, a: &Record, b: &Record) -> Ordering {
    let semantics = if field == ID_FIELD {
        Semantics::Identity
    } else {
        table
            .column(field)
            .map(|c| semantics_of(&c.column_type))
            .unwrap_or(Semantics::Untyped)
    };
    let left = comparable_values(a.get(field)).into_iter().find(|v| !is_blank(v));
    let right = comparable_values(b.get(field)).into_iter().find(|v| !is_blank(v));

    match (left, right) {
        (Some(l), Some(r)) => compare_scalars(semantics, &l, &r)
            .or_else(|| sort_key(&l).partial_cmp(&sort_key(&r)))
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::{RelatedRecord, RelatedRecordCollection};
    use serde_json::json;

    fn people() -> Table {
        Table::new("tbl_people", "people", "name")
            .with_column(Column::text("name"))
            .with_column(Column::number("age"))
            .with_column(Column::boolean("active"))
            .with_column(Column::datetime("joined"))
            .with_column(Column::foreign_key("team", "tbl_teams", false))
            .with_column(Column::foreign_key("projects", "tbl_projects", true))
    }

    fn alice() -> Record {
        let mut r = Record::new()
            .with("name", "Alice")
            .with("age", json!(30))
            .with("active", json!(true))
            .with("joined", "2023-04-01")
            .with("team", RelatedRecord::new("team1"))
            .with("projects", RelatedRecordCollection::from_ids(["p1", "p2"]));
        r.set_id("rec1");
        r
    }

    fn leaf(field: &str, op: Operator, value: Value) -> Condition {
        Condition::single(field, op, value)
    }

    #[test]
    fn test_text_is_case_insensitive() {
        let t = people();
        assert!(matches(&t, &alice(), &leaf("name", Operator::Eq, json!("alice"))));
        assert!(matches(&t, &alice(), &leaf("name", Operator::Contains, json!("LIC"))));
        assert!(matches(&t, &alice(), &leaf("name", Operator::Ncontains, json!("bob"))));
        assert!(!matches(&t, &alice(), &leaf("name", Operator::Neq, json!("ALICE"))));
    }

    #[test]
    fn test_contains_fails_closed_on_non_strings() {
        let t = people();
        assert!(!matches(&t, &alice(), &leaf("name", Operator::Contains, json!(3))));
        assert!(!matches(&t, &alice(), &leaf("name", Operator::Ncontains, json!(3))));
    }

    #[test]
    fn test_numeric_and_date_ordering() {
        let t = people();
        let r = alice();
        assert!(matches(&t, &r, &leaf("age", Operator::Gt, json!(18))));
        assert!(matches(&t, &r, &leaf("age", Operator::Lte, json!("30"))));
        assert!(!matches(&t, &r, &leaf("age", Operator::Lt, json!("thirty"))));
        assert!(matches(&t, &r, &leaf("joined", Operator::Gte, json!("2023-04-01T00:00:00Z"))));
        assert!(matches(&t, &r, &leaf("joined", Operator::Lt, json!("2024-01-01"))));
    }

    #[test]
    fn test_invalid_operator_fails_closed() {
        let t = people();
        assert!(!matches(&t, &alice(), &leaf("name", Operator::Gt, json!("a"))));
        assert!(!matches(&t, &alice(), &leaf("active", Operator::Contains, json!("t"))));
    }

    #[test]
    fn test_foreign_keys_compare_ids() {
        let t = people();
        let r = alice();
        assert!(matches(&t, &r, &leaf("team", Operator::Eq, json!("team1"))));
        assert!(matches(&t, &r, &leaf("projects", Operator::Eq, json!("p2"))));
        assert!(matches(&t, &r, &leaf("projects", Operator::Neq, json!("p3"))));
        assert!(matches(&t, &r, &leaf("id", Operator::Eq, json!("rec1"))));
    }

    #[test]
    fn test_null_checks() {
        let t = people();
        let r = alice().with("name", "");
        assert!(matches(&t, &r, &leaf("name", Operator::Null, Value::Null)));
        assert!(matches(&t, &r, &leaf("nickname", Operator::Null, Value::Null)));
        assert!(matches(&t, &r, &leaf("age", Operator::Notnull, Value::Null)));
    }

    #[test]
    fn test_groups() {
        let t = people();
        let r = alice();
        assert!(matches(&t, &r, &Condition::and(vec![])));
        assert!(!matches(&t, &r, &Condition::or(vec![])));
        let tree = Condition::and(vec![
            leaf("active", Operator::Eq, json!(true)),
            Condition::or(vec![
                leaf("age", Operator::Lt, json!(20)),
                leaf("name", Operator::Eq, json!("ALICE")),
            ]),
        ]);
        assert!(matches(&t, &r, &tree));
    }

    #[test]
    fn test_deep_nesting() {
        let t = people();
        let mut tree = leaf("age", Operator::Eq, json!(30));
        for i in 0..500 {
            tree = if i % 2 == 0 {
                Condition::and(vec![tree])
            } else {
                Condition::or(vec![tree])
            };
        }
        assert!(matches(&t, &alice(), &tree));
    }

    #[test]
    fn test_valid_operators() {
        let t = people();
        let boolean = valid_operators_for(t.column("active").unwrap());
        assert!(!boolean.contains(&Operator::Contains));
        assert!(!boolean.contains(&Operator::Gt));

        let text = valid_operators_for(t.column("name").unwrap());
        assert!(text.contains(&Operator::Contains));
        assert!(!text.contains(&Operator::Gte));

        let fk = valid_operators_for(t.column("team").unwrap());
        assert_eq!(fk, IDENTITY_OPS);

        let derived = Column::new("total", ColumnType::read_only(ColumnType::Number { precision: None }));
        assert!(valid_operators_for(&derived).contains(&Operator::Gt));
    }

    #[test]
    fn test_compare_field_missing_last() {
        let t = people();
        let a = Record::new().with("age", json!(5));
        let b = Record::new();
        assert_eq!(compare_field(&t, "age", &a, &b), Ordering::Less);
        let c = Record::new().with("age", json!(10));
        assert_eq!(compare_field(&t, "age", &c, &a), Ordering::Greater);
    }
}
