//! SQLite backend.
//!
//! Every statement runs while holding the `db_query` semaphore, so processes
//! sharing the database file take turns. Busy errors raised by SQLite itself
//! are retried until the semaphore timeout is spent.

use super::{
    DbError, DbResult, Dialect, Driver, FetchMode, QueryResult,
    semaphore::{Semaphores, random_pause},
};
use crate::{config::sqlite_file, sql::parse_query};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use sqlx::{
    Column, Executor, Row, Sqlite, Statement, TypeInfo, ValueRef,
    query::Query,
    sqlite::{
        SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use std::{fs, path::Path, str::FromStr, time::Duration};
use tracing::{debug, warn};

/// Semaphore serializing access to the database file.
const QUERY_SEMAPHORE: &str = "db_query";

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub struct SqliteDriver {
    pool: SqlitePool,
    semaphores: Semaphores,
    timeout: Duration,
}

impl SqliteDriver {
    /// Open `database_url`. A file database must already exist and be
    /// writable; `sqlite::memory:` is accepted as is.
    pub async fn connect(
        database_url: &str,
        semaphores: Semaphores,
        timeout: Duration,
    ) -> DbResult<Self> {
        let memory = match sqlite_file(database_url) {
            Some(file) => {
                let path = Path::new(file);
                if !path.is_file() {
                    return Err(DbError::FileNotFound(file.to_string()));
                }
                let writable = fs::metadata(path)
                    .map(|meta| !meta.permissions().readonly())
                    .unwrap_or(false);
                if !writable {
                    return Err(DbError::FileNotWritable(file.to_string()));
                }
                false
            }
            None => true,
        };

        let options = SqliteConnectOptions::from_str(database_url)?
            .busy_timeout(Duration::ZERO)
            .pragma("cache_size", "2000")
            .synchronous(SqliteSynchronous::Off)
            .foreign_keys(false);

        // An in-memory database lives as long as its connection.
        let pool_options = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;
        debug!("sqlite connected (memory: {})", memory);

        Ok(Self {
            pool,
            semaphores,
            timeout,
        })
    }

    async fn run(&self, query: &str, fetch: FetchMode, params: &[Value]) -> Result<QueryResult, sqlx::Error> {
        let mut statement: SqliteQuery<'_> = sqlx::query(query);
        for param in params {
            statement = bind_value(statement, param);
        }
        let rows = statement.fetch_all(&self.pool).await?;
        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None if fetch != FetchMode::Query => self.describe(query).await,
            None => Vec::new(),
        };
        let raw = rows
            .iter()
            .map(|row| (0..row.len()).map(|index| row_value(row, index)).collect())
            .collect();
        Ok(QueryResult::shape(columns, raw, fetch))
    }

    /// Column names of a statement that returned no rows.
    async fn describe(&self, query: &str) -> Vec<String> {
        match (&self.pool).prepare(query).await {
            Ok(statement) => statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// True for the errors SQLite raises while another connection holds the file.
fn is_busy(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked") || message.contains("database schema has changed")
}

/// Double single quotes, the only escaping SQLite string literals need.
pub fn escape_sqlite(value: &str) -> String {
    value.replace('\'', "''")
}

fn bind_value<'q>(statement: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
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

fn row_value(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_uppercase(),
        Err(_) => return Value::Null,
    };
    match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "INT4" | "INT8" | "BOOLEAN" => row
            .try_get_unchecked::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row
            .try_get_unchecked::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| match String::from_utf8(bytes) {
                Ok(text) => Value::String(text),
                Err(err) => Value::String(BASE64.encode(err.into_bytes())),
            })
            .unwrap_or(Value::Null),
        _ => row
            .try_get_unchecked::<String, _>(index)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn check(&self, query: &str) -> bool {
        self.query(query, FetchMode::Query, &[]).await.is_ok()
    }

    fn escape(&self, value: &str) -> String {
        escape_sqlite(value)
    }

    async fn query(&self, query: &str, fetch: FetchMode, params: &[Value]) -> DbResult<QueryResult> {
        let query = parse_query(query, Dialect::Sqlite);
        let query = query.trim();
        if query.is_empty() {
            return Ok(QueryResult::empty());
        }

        let _guard = match self.semaphores.acquire(QUERY_SEMAPHORE, self.timeout).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("{}", err);
                return Err(DbError::Semaphore {
                    query: query.to_string(),
                });
            }
        };

        let mut remaining = self.timeout;
        loop {
            match self.run(query, fetch, params).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let message = err.to_string();
                    if is_busy(&message) && !remaining.is_zero() {
                        let pause = random_pause();
                        tokio::time::sleep(pause).await;
                        remaining = remaining.saturating_sub(pause);
                        continue;
                    }
                    return Err(DbError::Query {
                        message,
                        query: query.to_string(),
                    });
                }
            }
        }
    }

    async fn disconnect(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn driver(dir: &Path) -> SqliteDriver {
        SqliteDriver::connect(
            "sqlite::memory:",
            Semaphores::new(dir),
            Duration::from_millis(200),
        )
        .await
        .unwrap()
    }

    #[test]
    fn escapes_single_quotes() {
        assert_eq!(escape_sqlite("O'Hara"), "O''Hara");
    }

    #[test]
    fn busy_messages_are_retryable() {
        assert!(is_busy("error returned from database: (code: 5) database is locked"));
        assert!(is_busy("Database schema has changed"));
        assert!(!is_busy("no such table: t"));
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/missing.db", dir.path().display());
        let err = SqliteDriver::connect(&url, Semaphores::new(dir.path()), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn pragmas_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let db = driver(dir.path()).await;
        let result = db.query("PRAGMA foreign_keys", FetchMode::Auto, &[]).await.unwrap();
        assert_eq!(result.fetch_all(), vec![json!(0)]);
        let result = db.query("PRAGMA cache_size", FetchMode::Auto, &[]).await.unwrap();
        assert_eq!(result.fetch_all(), vec![json!(2000)]);
    }

    #[tokio::test]
    async fn dialect_comments_and_empty_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = driver(dir.path()).await;
        let result = db
            .query("/*MYSQL SELECT 'm' *//*SQLITE SELECT 's' AS v */", FetchMode::Query, &[])
            .await
            .unwrap();
        assert_eq!(result.fetch_all(), vec![json!({"v": "s"})]);

        let empty = db.query("/*MYSQL SHOW TABLES */", FetchMode::Query, &[]).await.unwrap();
        assert_eq!(empty, QueryResult::empty());
    }

    #[tokio::test]
    async fn errors_carry_the_query() {
        let dir = tempfile::tempdir().unwrap();
        let db = driver(dir.path()).await;
        let err = db.query("SELECT * FROM nowhere", FetchMode::Query, &[]).await.unwrap_err();
        match err {
            DbError::Query { message, query } => {
                assert!(message.contains("no such table"));
                assert_eq!(query, "SELECT * FROM nowhere");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!db.check("SELECT * FROM nowhere").await);
        assert!(db.check("SELECT 1").await);
    }

    #[tokio::test]
    async fn held_semaphore_times_out_the_query() {
        let dir = tempfile::tempdir().unwrap();
        let db = driver(dir.path()).await;
        let _held = Semaphores::new(dir.path())
            .acquire(QUERY_SEMAPHORE, Duration::from_millis(10))
            .await
            .unwrap();
        let err = db.query("SELECT 1", FetchMode::Query, &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "Could not acquire the semaphore");
    }

    #[tokio::test]
    async fn values_keep_their_types() {
        let dir = tempfile::tempdir().unwrap();
        let db = driver(dir.path()).await;
        let result = db
            .query(
                "SELECT 1 AS i, 1.5 AS f, 'x' AS s, NULL AS n, ? AS p",
                FetchMode::Query,
                &[json!("bound")],
            )
            .await
            .unwrap();
        assert_eq!(
            result.fetch_all(),
            vec![json!({"i": 1, "f": 1.5, "s": "x", "n": null, "p": "bound"})]
        );
    }
}
