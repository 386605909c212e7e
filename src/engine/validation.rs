//! Structural record validation
//!
//! A `Validator` is derived from a table's columns and can be augmented by
//! hooks before it runs. Validation reports every failing field, never just
//! the first.

use serde_json::Value;
use std::sync::Arc;

use super::error::{FieldViolation, ValidationError};
use super::evaluator::as_timestamp;
use super::schema::{Column, ColumnType, FieldValue, Record, Table};

/// Custom check on a present, non-empty value
pub type FieldRule = Arc<dyn Fn(&FieldValue) -> Result<(), String> + Send + Sync>;

/// Whole-record check returning any violations it finds
pub type TableRule = Arc<dyn Fn(&Record) -> Vec<FieldViolation> + Send + Sync>;

/// Checks for a single field
#[derive(Clone)]
pub struct FieldValidator {
    pub field: String,
    pub required: bool,
    column_type: Option<ColumnType>,
    rules: Vec<FieldRule>,
}

impl FieldValidator {
    /// Untyped validator, only enforcing `required` and custom rules
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            required: false,
            column_type: None,
            rules: Vec::new(),
        }
    }

    pub fn from_column(column: &Column) -> Self {
        Self {
            column_type: Some(column.column_type.clone()),
            ..Self::new(&column.name)
        }
    }

    pub fn require(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&FieldValue) -> Result<(), String> + Send + Sync + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    /// First failure message for `value`, if any.
    pub fn check(&self, value: Option<&FieldValue>) -> Option<String> {
        let value = match value {
            Some(v) if !v.is_empty() => v,
            _ if self.required => return Some("is required".to_string()),
            _ => return None,
        };

        if let Some(column_type) = &self.column_type {
            if let Err(msg) = check_type(column_type, value) {
                return Some(msg);
            }
        }

        self.rules.iter().find_map(|rule| rule(value).err())
    }
}

fn check_type(column_type: &ColumnType, value: &FieldValue) -> Result<(), String> {
    let scalar = value.as_scalar();
    match column_type {
        ColumnType::Text { .. } => match scalar {
            Some(Value::String(_)) => Ok(()),
            _ => Err("must be text".to_string()),
        },
        ColumnType::Number { .. } => match scalar {
            Some(Value::Number(_)) => Ok(()),
            _ => Err("must be a number".to_string()),
        },
        ColumnType::Boolean => match scalar {
            Some(Value::Bool(_)) => Ok(()),
            _ => Err("must be true or false".to_string()),
        },
        ColumnType::DateTime { .. } => match scalar {
            Some(v) if as_timestamp(v).is_some() => Ok(()),
            _ => Err("must be a valid date".to_string()),
        },
        ColumnType::Select { options } => match scalar {
            Some(Value::String(s)) if options.is_empty() || options.contains(s) => Ok(()),
            _ => Err(format!("must be one of: {}", options.join(", "))),
        },
        ColumnType::MultiSelect { options } => match scalar {
            Some(Value::Array(items))
                if items.iter().all(|i| {
                    i.as_str()
                        .map(|s| options.is_empty() || options.iter().any(|o| o == s))
                        .unwrap_or(false)
                }) =>
            {
                Ok(())
            }
            _ => Err(format!("must be a list of: {}", options.join(", "))),
        },
        ColumnType::ForeignKey { multiple, .. } => {
            let shape_ok = match value {
                FieldValue::Related(_) => true,
                FieldValue::Collection(_) => true,
                FieldValue::Scalar(Value::String(_)) => true,
                FieldValue::Scalar(Value::Array(items)) => items.iter().all(Value::is_string),
                FieldValue::Scalar(_) => false,
            };
            if !shape_ok {
                return Err("must reference a record".to_string());
            }
            if !multiple && value.reference_ids().len() > 1 {
                return Err("accepts a single reference".to_string());
            }
            Ok(())
        }
        ColumnType::ReadOnly { .. } => Err("is read-only".to_string()),
    }
}

/// Validator for a whole record
#[derive(Clone, Default)]
pub struct Validator {
    fields: Vec<FieldValidator>,
    table_rules: Vec<TableRule>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// One typed validator per writable, validated column.
    pub fn from_table(table: &Table) -> Self {
        Self {
            fields: validated_columns(table).map(FieldValidator::from_column).collect(),
            table_rules: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValidator> {
        self.fields.iter().find(|f| f.field == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldValidator> {
        self.fields.iter_mut().find(|f| f.field == name)
    }

    /// Insert or replace the validator for `validator.field`.
    pub fn set_field(&mut self, validator: FieldValidator) {
        match self.field_mut(&validator.field) {
            Some(existing) => *existing = validator,
            None => self.fields.push(validator),
        }
    }

    pub fn remove_field(&mut self, name: &str) -> Option<FieldValidator> {
        let pos = self.fields.iter().position(|f| f.field == name)?;
        Some(self.fields.remove(pos))
    }

    pub fn require(&mut self, name: &str) -> &mut Self {
        match self.field_mut(name) {
            Some(field) => field.required = true,
            None => self.fields.push(FieldValidator::new(name).require()),
        }
        self
    }

    pub fn add_rule<F>(&mut self, name: &str, rule: F) -> &mut Self
    where
        F: Fn(&FieldValue) -> Result<(), String> + Send + Sync + 'static,
    {
        let field = self
            .remove_field(name)
            .unwrap_or_else(|| FieldValidator::new(name))
            .rule(rule);
        self.fields.push(field);
        self
    }

    pub fn add_table_rule<F>(&mut self, rule: F) -> &mut Self
    where
        F: Fn(&Record) -> Vec<FieldViolation> + Send + Sync + 'static,
    {
        self.table_rules.push(Arc::new(rule));
        self
    }

    /// Run every check, collecting all violations.
    pub fn validate(&self, record: &Record) -> Result<(), ValidationError> {
        let mut errors: Vec<FieldViolation> = self
            .fields
            .iter()
            .filter_map(|f| {
                f.check(record.get(&f.field))
                    .map(|message| FieldViolation::new(f.field.clone(), message))
            })
            .collect();

        for rule in &self.table_rules {
            errors.extend(rule(record));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors })
        }
    }
}

/// Columns that take part in validation
pub fn validated_columns(table: &Table) -> impl Iterator<Item = &Column> {
    table
        .columns
        .iter()
        .filter(|c| !c.novalidate && !c.is_read_only())
}
