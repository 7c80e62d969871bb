//! MySQL backend. Statements run straight on the pool; the server does its
//! own locking.

use super::{DbError, DbResult, Dialect, Driver, FetchMode, QueryResult};
use crate::sql::parse_query;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use sqlx::{
    Column, Executor, MySql, Row, Statement, TypeInfo, ValueRef,
    mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow},
    query::Query,
};
use tracing::debug;

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

pub struct MySqlDriver {
    pool: MySqlPool,
}

impl MySqlDriver {
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        debug!("mysql connected");
        Ok(Self { pool })
    }

    async fn run(&self, query: &str, fetch: FetchMode, params: &[Value]) -> Result<QueryResult, sqlx::Error> {
        let mut statement: MySqlQuery<'_> = sqlx::query(query);
        for param in params {
            statement = bind_value(statement, param);
        }
        let rows = statement.fetch_all(&self.pool).await?;
        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None if fetch != FetchMode::Query => match (&self.pool).prepare(query).await {
                Ok(statement) => statement.columns().iter().map(|c| c.name().to_string()).collect(),
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        };
        let raw = rows
            .iter()
            .map(|row| (0..row.len()).map(|index| row_value(row, index)).collect())
            .collect();
        Ok(QueryResult::shape(columns, raw, fetch))
    }
}

/// Escaping of `mysql_real_escape_string`.
pub fn escape_mysql(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            other => out.push(other),
        }
    }
    out
}

fn bind_value<'q>(statement: MySqlQuery<'q>, value: &Value) -> MySqlQuery<'q> {
    match value {
        Value::Null => statement.bind(None::<String>),
        Value::Bool(b) => statement.bind(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => statement.bind(i),
            None => statement.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => statement.bind(s.clone()),
        other => statement.bind(other.to_string()),
    }
}

fn bytes_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(err) => Value::String(BASE64.encode(err.into_bytes())),
    }
}

fn row_value(row: &MySqlRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_uppercase(),
        Err(_) => return Value::Null,
    };
    let base = type_name.trim_end_matches(" UNSIGNED");
    match base {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            if type_name.ends_with("UNSIGNED") {
                row.try_get_unchecked::<u64, _>(index).map(Value::from)
            } else {
                row.try_get_unchecked::<i64, _>(index).map(Value::from)
            }
            .unwrap_or(Value::Null)
        }
        "FLOAT" | "DOUBLE" => row
            .try_get_unchecked::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get_unchecked::<NaiveDate, _>(index)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        "TIME" => row
            .try_get_unchecked::<NaiveTime, _>(index)
            .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        "DATETIME" | "TIMESTAMP" => row
            .try_get_unchecked::<NaiveDateTime, _>(index)
            .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get_unchecked::<String, _>(index)
            .map(Value::String)
            .or_else(|_| row.try_get_unchecked::<Vec<u8>, _>(index).map(bytes_value))
            .unwrap_or(Value::Null),
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn check(&self, query: &str) -> bool {
        self.query(query, FetchMode::Query, &[]).await.is_ok()
    }

    fn escape(&self, value: &str) -> String {
        escape_mysql(value)
    }

    async fn query(&self, query: &str, fetch: FetchMode, params: &[Value]) -> DbResult<QueryResult> {
        let query = parse_query(query, Dialect::Mysql);
        let query = query.trim();
        if query.is_empty() {
            return Ok(QueryResult::empty());
        }
        self.run(query, fetch, params)
            .await
            .map_err(|err| DbError::Query {
                message: err.to_string(),
                query: query.to_string(),
            })
    }

    async fn disconnect(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_like_the_client_library() {
        assert_eq!(escape_mysql("it's"), "it\\'s");
        assert_eq!(escape_mysql("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(escape_mysql("l1\nl2\r\0\x1a"), "l1\\nl2\\r\\0\\Z");
    }
}
