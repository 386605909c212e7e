//! Query model: condition trees, sorting and paging

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use super::schema::ID_FIELD;

/// Default page size when a page is requested without one
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Contains,
    Ncontains,
    Gt,
    Lt,
    Gte,
    Lte,
    Notnull,
    Null,
}

impl Operator {
    /// Unary operators ignore the condition value
    pub fn is_unary(&self) -> bool {
        matches!(self, Operator::Notnull | Operator::Null)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Contains => "contains",
            Operator::Ncontains => "ncontains",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Notnull => "notnull",
            Operator::Null => "null",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKind {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// Leaf condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleCondition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

/// AND/OR group of conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(rename = "type")]
    pub kind: GroupKind,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Boolean condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "conditionType", rename_all = "lowercase")]
pub enum Condition {
    Single(SingleCondition),
    Group(ConditionGroup),
}

impl Condition {
    pub fn single(field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        Condition::Single(SingleCondition {
            field: field.to_string(),
            operator,
            value: value.into(),
        })
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            kind: GroupKind::And,
            conditions,
        })
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            kind: GroupKind::Or,
            conditions,
        })
    }

    /// OR group matching any of the given record ids.
    pub fn any_id<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Condition::or(
            ids.into_iter()
                .map(|id| Condition::single(ID_FIELD, Operator::Eq, id.as_ref()))
                .collect(),
        )
    }
}

/// Sort key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortExpr {
    pub column: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

fn default_true() -> bool {
    true
}

impl SortExpr {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: true,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(SortExpr),
    Many(Vec<SortExpr>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<SortExpr>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    })
}

/// Retrieval parameters for `retrieve_records`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,

    /// 1-based page number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,

    /// Ignore paging and return every match
    #[serde(default)]
    pub retrieve_all: bool,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortExpr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions = Some(condition);
        self
    }

    pub fn sort_by(mut self, sort: SortExpr) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn all(mut self) -> Self {
        self.retrieve_all = true;
        self
    }

    pub fn expand(mut self, field: &str) -> Self {
        self.expand.push(field.to_string());
        self
    }

    pub fn effective_page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    pub fn effective_page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
    }

    /// Slice a fully materialised result set according to paging.
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        if self.retrieve_all {
            return items;
        }
        let size = self.effective_page_size();
        let skip = (self.effective_page() - 1).saturating_mul(size);
        items.into_iter().skip(skip).take(size).collect()
    }
}

/// Query-string parameters of the list endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub expand: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub all: Option<bool>,
    /// Comma separated column names
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub ascending: Option<bool>,
}

impl QueryParams {
    pub fn expansion(&self) -> Vec<String> {
        split_list(self.expand.as_deref())
    }

    /// Combine with an optional body condition tree.
    pub fn into_query(self, conditions: Option<Condition>) -> Query {
        let ascending = self.ascending.unwrap_or(true);
        Query {
            conditions,
            page: self.page,
            page_size: self.page_size,
            view: self.view.clone(),
            retrieve_all: self.all.unwrap_or(false),
            sort: split_list(self.sort.as_deref())
                .into_iter()
                .map(|column| SortExpr { column, ascending })
                .collect(),
            expand: self.expansion(),
        }
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
