//! Driver-independent query results.
//!
//! Every backend hands its column names and raw rows to [`QueryResult::shape`],
//! so callers always see the same `{total, header, rows}` structure no matter
//! which database answered.

use super::DbError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// One result row keyed by column name, in column order.
pub type Record = Map<String, Value>;

/// How a result set is turned into rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Rows are records of column name to value.
    #[default]
    Query,
    /// Rows are the first column's values.
    Column,
    /// A single row with every first-column value joined by commas.
    Concat,
    /// `Column` for single-column results, `Query` otherwise.
    Auto,
}

impl FromStr for FetchMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "column" => Ok(Self::Column),
            "concat" => Ok(Self::Concat),
            "auto" => Ok(Self::Auto),
            other => Err(DbError::Invalid(format!("Unknown fetch mode '{}'", other))),
        }
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Query => "query",
            Self::Column => "column",
            Self::Concat => "concat",
            Self::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Row payload of a [`QueryResult`], depending on the fetch mode used.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Rows {
    Records(Vec<Record>),
    Column(Vec<Value>),
    Concat(Vec<String>),
}

impl Default for Rows {
    fn default() -> Self {
        Rows::Records(Vec::new())
    }
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Rows::Records(rows) => rows.len(),
            Rows::Column(rows) => rows.len(),
            Rows::Concat(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Uniform result of `db_query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub total: usize,
    pub header: Vec<String>,
    pub rows: Rows,
}

impl QueryResult {
    /// The result of a statement that produced nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a result from raw driver output.
    ///
    /// `columns` is empty for statements without a result set (INSERT,
    /// UPDATE, PRAGMA setters, ...), which always yields the empty result.
    pub fn shape(columns: Vec<String>, raw: Vec<Vec<Value>>, fetch: FetchMode) -> Self {
        if columns.is_empty() {
            return Self::empty();
        }
        let fetch = match fetch {
            FetchMode::Auto if columns.len() > 1 => FetchMode::Query,
            FetchMode::Auto => FetchMode::Column,
            other => other,
        };
        match fetch {
            FetchMode::Query => {
                let rows: Vec<Record> = raw
                    .into_iter()
                    .map(|values| columns.iter().cloned().zip(values).collect())
                    .collect();
                let header = if rows.is_empty() { Vec::new() } else { columns };
                Self {
                    total: rows.len(),
                    header,
                    rows: Rows::Records(rows),
                }
            }
            FetchMode::Column | FetchMode::Auto => {
                let rows: Vec<Value> = raw
                    .into_iter()
                    .map(|values| values.into_iter().next().unwrap_or(Value::Null))
                    .collect();
                Self {
                    total: rows.len(),
                    header: vec!["column".into()],
                    rows: Rows::Column(rows),
                }
            }
            FetchMode::Concat => {
                let joined = raw
                    .into_iter()
                    .filter_map(|values| values.into_iter().next())
                    .filter(|value| !value.is_null())
                    .map(|value| scalar_to_string(&value))
                    .collect::<Vec<_>>();
                let rows = if joined.is_empty() {
                    Vec::new()
                } else {
                    vec![joined.join(",")]
                };
                Self {
                    total: rows.len(),
                    header: vec!["concat".into()],
                    rows: Rows::Concat(rows),
                }
            }
        }
    }

    pub fn num_rows(&self) -> usize {
        self.total
    }

    pub fn num_fields(&self) -> usize {
        self.header.len()
    }

    pub fn field_name(&self, index: usize) -> Result<&str, DbError> {
        self.header
            .get(index)
            .map(String::as_str)
            .ok_or(DbError::FieldIndex(index))
    }

    /// Row `index` as a JSON value, `None` past the end.
    pub fn fetch_row(&self, index: usize) -> Option<Value> {
        match &self.rows {
            Rows::Records(rows) => rows.get(index).cloned().map(Value::Object),
            Rows::Column(rows) => rows.get(index).cloned(),
            Rows::Concat(rows) => rows.get(index).cloned().map(Value::String),
        }
    }

    /// Rows in order, as [`QueryResult::fetch_row`] returns them.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.rows.len()).filter_map(|index| self.fetch_row(index))
    }

    /// Reset to the empty result, releasing the rows.
    pub fn free(&mut self) {
        *self = Self::empty();
    }

    /// All rows as JSON values: records become objects, column and concat
    /// rows stay scalars.
    pub fn fetch_all(self) -> Vec<Value> {
        match self.rows {
            Rows::Records(rows) => rows.into_iter().map(Value::Object).collect(),
            Rows::Column(rows) => rows,
            Rows::Concat(rows) => rows.into_iter().map(Value::String).collect(),
        }
    }

    /// The records of a `query` fetch; scalar rows are wrapped under their
    /// header name.
    pub fn into_records(self) -> Vec<Record> {
        let key = self.header.first().cloned().unwrap_or_default();
        match self.rows {
            Rows::Records(rows) => rows,
            other => QueryResult {
                total: 0,
                header: Vec::new(),
                rows: other,
            }
            .fetch_all()
            .into_iter()
            .map(|value| {
                let mut record = Record::new();
                record.insert(key.clone(), value);
                record
            })
            .collect(),
        }
    }

    /// Deserialize every record into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Vec<T>, DbError> {
        self.into_records()
            .into_iter()
            .map(|record| {
                serde_json::from_value(Value::Object(record))
                    .map_err(|err| DbError::Invalid(format!("Cannot decode row: {}", err)))
            })
            .collect()
    }
}

impl IntoIterator for QueryResult {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    /// Rows in result order, the `db_fetch_row` loop.
    fn into_iter(self) -> Self::IntoIter {
        self.fetch_all().into_iter()
    }
}

/// The map of a JSON object, empty for anything else.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Render a scalar JSON value the way it is stored in SQL text.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => String::from(if *b { "1" } else { "0" }),
        other => other.to_string(),
    }
}
