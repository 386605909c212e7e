//! Condition tree to AirTable formula compiler
//!
//! Most leaves translate exactly. Those the formula language cannot express
//! with the evaluator's semantics compile to a condition that matches a
//! superset of the true result, and the formula is marked inexact so the
//! backend filters the fetched rows again in memory.

use serde_json::Value;

use crate::engine::evaluator::{as_timestamp, valid_operators_for};
use crate::engine::query::{Condition, GroupKind, Operator, SingleCondition};
use crate::engine::schema::{ColumnType, Table, ID_FIELD};

pub const TRUE: &str = "TRUE()";
pub const FALSE: &str = "FALSE()";

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub expression: String,
    /// False when rows must be re-checked locally
    pub exact: bool,
}

impl Formula {
    fn exact(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            exact: true,
        }
    }

    fn approximate(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            exact: false,
        }
    }

    fn anything() -> Self {
        Self::approximate(TRUE)
    }

    /// True when the formula filters nothing.
    pub fn is_trivial(&self) -> bool {
        self.expression == TRUE
    }
}

pub fn compile(table: &Table, condition: &Condition) -> Formula {
    match condition {
        Condition::Single(leaf) => compile_leaf(table, leaf),
        Condition::Group(group) => {
            let (function, empty) = match group.kind {
                GroupKind::And => ("AND", TRUE),
                GroupKind::Or => ("OR", FALSE),
            };
            if group.conditions.is_empty() {
                return Formula::exact(empty);
            }
            let children: Vec<Formula> =
                group.conditions.iter().map(|c| compile(table, c)).collect();
            Formula {
                expression: format!(
                    "{}({})",
                    function,
                    children
                        .iter()
                        .map(|c| c.expression.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                exact: children.iter().all(|c| c.exact),
            }
        }
    }
}

fn compile_leaf(table: &Table, leaf: &SingleCondition) -> Formula {
    let column = match table.column(&leaf.field) {
        Some(column) => column,
        None if leaf.field == ID_FIELD => return compile_record_id(leaf),
        None => return Formula::anything(),
    };
    if !valid_operators_for(column).contains(&leaf.operator) {
        return Formula::exact(FALSE);
    }

    let field = field_ref(&column.name);
    match &column.column_type {
        ColumnType::Text { .. } | ColumnType::Select { .. } => compile_text(&field, leaf),
        ColumnType::Number { .. } => compile_number(&field, leaf),
        ColumnType::DateTime { .. } => compile_date(&field, leaf),
        ColumnType::Boolean => compile_boolean(&field, leaf),
        ColumnType::MultiSelect { .. } | ColumnType::ForeignKey { .. } => {
            // links render display names in formulas, not ids
            blank_check(&field, leaf.operator).unwrap_or_else(Formula::anything)
        }
        ColumnType::ReadOnly { .. } => Formula::anything(),
    }
}

fn compile_record_id(leaf: &SingleCondition) -> Formula {
    match (leaf.operator, leaf.value.as_str()) {
        (Operator::Eq, Some(id)) => Formula::exact(format!("RECORD_ID() = {}", quote(id))),
        (Operator::Neq, Some(id)) => Formula::exact(format!("RECORD_ID() != {}", quote(id))),
        (Operator::Null, _) => Formula::exact(FALSE),
        (Operator::Notnull, _) => Formula::exact(TRUE),
        _ => Formula::anything(),
    }
}

fn compile_text(field: &str, leaf: &SingleCondition) -> Formula {
    if let Some(formula) = blank_check(field, leaf.operator) {
        return formula;
    }
    let left = format!("LOWER({})", field);
    let Some(value) = leaf.value.as_str() else {
        return Formula::anything();
    };
    let right = format!("LOWER({})", quote(value));

    match leaf.operator {
        Operator::Eq => Formula::exact(format!("{} = {}", left, right)),
        Operator::Neq => Formula::exact(format!("{} != {}", left, right)),
        Operator::Contains => Formula::exact(format!("FIND({}, {})", right, left)),
        Operator::Ncontains => Formula::exact(format!(
            "AND(NOT({} = ''), NOT(FIND({}, {})))",
            field, right, left
        )),
        _ => Formula::anything(),
    }
}

/// Blank cells compare as zero in formulas, while the evaluator never lets a
/// blank satisfy a comparison except `neq`. Comparisons that zero satisfies
/// are therefore re-checked locally.
fn compile_number(field: &str, leaf: &SingleCondition) -> Formula {
    let number = match &leaf.value {
        Value::Number(n) => n.as_f64().map(|v| (v, n.to_string())),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|v| (v, v.to_string())),
        _ => None,
    };
    let Some((value, literal)) = number else {
        return Formula::anything();
    };

    let comparison = |op: &str| format!("{} {} {}", field, op, literal);
    let zero_matches = match leaf.operator {
        Operator::Eq => value == 0.0,
        Operator::Gt => 0.0 > value,
        Operator::Gte => 0.0 >= value,
        Operator::Lt => 0.0 < value,
        Operator::Lte => 0.0 <= value,
        Operator::Neq if value == 0.0 => {
            return Formula::approximate(format!(
                "OR({} = BLANK(), {})",
                field,
                comparison("!=")
            ));
        }
        Operator::Neq => return Formula::exact(comparison("!=")),
        _ => return Formula::anything(),
    };
    let op = match leaf.operator {
        Operator::Eq => "=",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Lt => "<",
        _ => "<=",
    };
    if zero_matches {
        Formula::approximate(comparison(op))
    } else {
        Formula::exact(comparison(op))
    }
}

/// `null`/`notnull` as an empty-string test; `None` for binary operators.
fn blank_check(field: &str, operator: Operator) -> Option<Formula> {
    if !operator.is_unary() {
        return None;
    }
    Some(match operator {
        Operator::Null => Formula::exact(format!("{} = ''", field)),
        _ => Formula::exact(format!("NOT({} = '')", field)),
    })
}

fn compile_date(field: &str, leaf: &SingleCondition) -> Formula {
    if let Some(formula) = blank_check(field, leaf.operator) {
        return formula;
    }
    let Some(date) = as_timestamp(&leaf.value) else {
        return Formula::anything();
    };
    let date = format!("DATETIME_PARSE({})", quote(&date.to_rfc3339()));

    let call = |function: &str| format!("{}({}, {})", function, field, date);
    match leaf.operator {
        Operator::Eq => Formula::exact(call("IS_SAME")),
        Operator::Gt => Formula::exact(call("IS_AFTER")),
        Operator::Lt => Formula::exact(call("IS_BEFORE")),
        Operator::Gte => Formula::exact(format!("OR({}, {})", call("IS_SAME"), call("IS_AFTER"))),
        Operator::Lte => Formula::exact(format!("OR({}, {})", call("IS_SAME"), call("IS_BEFORE"))),
        _ => Formula::anything(),
    }
}

fn compile_boolean(field: &str, leaf: &SingleCondition) -> Formula {
    let expected = match &leaf.value {
        Value::Bool(b) => *b,
        Value::String(s) if s.eq_ignore_ascii_case("true") => true,
        Value::String(s) if s.eq_ignore_ascii_case("false") => false,
        _ => return Formula::anything(),
    };
    let literal = if expected { TRUE } else { FALSE };
    match leaf.operator {
        Operator::Eq => Formula::exact(format!("{} = {}", field, literal)),
        Operator::Neq => Formula::exact(format!("{} != {}", field, literal)),
        _ => Formula::anything(),
    }
}

/// `{Field name}` reference; braces inside the name are escaped.
fn field_ref(name: &str) -> String {
    format!("{{{}}}", name.replace('}', "\\}"))
}

/// Single-quoted string literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
