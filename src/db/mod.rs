//! Database access: one [`Driver`] per backend behind the [`Database`] facade.
//!
//! Drivers only execute statements and hand back raw rows; shaping into
//! [`QueryResult`] happens in `result.rs` so every backend answers alike.

pub mod mysql;
pub mod result;
pub mod semaphore;
pub mod sqlite;

pub use result::{FetchMode, QueryResult, Record, Rows, record};

use crate::{config::AppConfig, errors::ErrorReport, errors::Section, services::log_service::LogService};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    fmt,
    str::FromStr,
    sync::{Arc, RwLock},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database type '{0}' not found")]
    UnknownDriver(String),
    #[error("Unknown database connector")]
    Disconnected,
    #[error("File '{0}' not found")]
    FileNotFound(String),
    #[error("File '{0}' not writable")]
    FileNotWritable(String),
    #[error("Could not acquire the semaphore")]
    Semaphore { query: String },
    #[error("{message}")]
    Query { message: String, query: String },
    #[error("Unknown field name at position {0}")]
    FieldIndex(usize),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    /// The statement that failed, when there is one.
    pub fn query(&self) -> Option<&str> {
        match self {
            DbError::Semaphore { query } | DbError::Query { query, .. } => Some(query),
            _ => None,
        }
    }

    /// Which error log the failure belongs to.
    pub fn section(&self) -> Section {
        match self {
            DbError::Query { .. } | DbError::Sqlx(_) | DbError::UnknownDriver(_) => Section::DbError,
            DbError::Disconnected => Section::DbError,
            _ => Section::ServerError,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// SQL flavour understood by a driver; selects the `/*MYSQL ...*/` or
/// `/*SQLITE ...*/` fragments of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

impl Dialect {
    pub fn tag(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SQLITE",
            Dialect::Mysql => "MYSQL",
        }
    }
}

/// Backends selectable through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Sqlite,
    Mysql,
}

impl FromStr for DriverKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" | "pdo_sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mysql" | "pdo_mysql" | "mysqli" => Ok(Self::Mysql),
            other => Err(DbError::UnknownDriver(other.to_string())),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Sqlite => f.write_str("sqlite"),
            DriverKind::Mysql => f.write_str("mysql"),
        }
    }
}

/// Contract every database backend implements.
#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// True when `query` executes without error.
    async fn check(&self, query: &str) -> bool;

    /// Escape `value` for inclusion inside a single-quoted SQL literal.
    fn escape(&self, value: &str) -> String;

    async fn query(&self, query: &str, fetch: FetchMode, params: &[Value]) -> DbResult<QueryResult>;

    async fn disconnect(&self);
}

#[derive(Clone)]
struct SlowQueryTrace {
    threshold: f64,
    log: LogService,
}

/// Handle shared by every service; cheap to clone.
#[derive(Clone)]
pub struct Database {
    driver: Arc<RwLock<Option<Arc<dyn Driver>>>>,
    slow_query: Option<SlowQueryTrace>,
}

impl Database {
    pub fn from_driver(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver: Arc::new(RwLock::new(Some(driver))),
            slow_query: None,
        }
    }

    /// Open the backend named by `cfg.db_type`.
    pub async fn connect(cfg: &AppConfig, log: LogService) -> DbResult<Self> {
        let kind: DriverKind = cfg.db_type.parse()?;
        debug!("connecting {} driver", kind);
        let driver: Arc<dyn Driver> = match kind {
            DriverKind::Sqlite => Arc::new(
                sqlite::SqliteDriver::connect(
                    &cfg.database_url,
                    semaphore::Semaphores::new(cfg.semaphore_dir()),
                    cfg.semaphore_timeout,
                )
                .await?,
            ),
            DriverKind::Mysql => Arc::new(mysql::MySqlDriver::connect(&cfg.database_url).await?),
        };
        let mut db = Self::from_driver(driver);
        if let Some(threshold) = cfg.slow_query_time {
            db = db.with_slow_query_trace(threshold, log);
        }
        Ok(db)
    }

    /// Trace queries slower than `threshold` seconds to the dbwarning log.
    pub fn with_slow_query_trace(mut self, threshold: f64, log: LogService) -> Self {
        self.slow_query = Some(SlowQueryTrace { threshold, log });
        self
    }

    fn driver(&self) -> DbResult<Arc<dyn Driver>> {
        self.driver
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(DbError::Disconnected)
    }

    pub fn dialect(&self) -> DbResult<Dialect> {
        Ok(self.driver()?.dialect())
    }

    pub async fn check(&self, query: &str) -> bool {
        match self.driver() {
            Ok(driver) => driver.check(query).await,
            Err(_) => false,
        }
    }

    pub fn escape(&self, value: &str) -> DbResult<String> {
        Ok(self.driver()?.escape(value))
    }

    /// `db_query` with the default `query` fetch mode.
    pub async fn query(&self, query: &str, params: &[Value]) -> DbResult<QueryResult> {
        self.fetch(query, FetchMode::Query, params).await
    }

    /// `db_query` with an explicit fetch mode.
    pub async fn fetch(
        &self,
        query: &str,
        fetch: FetchMode,
        params: &[Value],
    ) -> DbResult<QueryResult> {
        let driver = self.driver()?;
        let started = Instant::now();
        let result = driver.query(query, fetch, params).await;
        if let Some(trace) = &self.slow_query {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > trace.threshold {
                warn!("slow query took {:.3}s", elapsed);
                let report = ErrorReport::new(
                    Section::DbWarning,
                    format!("Slow query requires {} seconds", elapsed),
                )
                .with(Section::Query, query);
                if let Err(err) = trace.log.add_trace(report, "dbwarning.log").await {
                    warn!("could not write slow query trace: {}", err);
                }
            }
        }
        result
    }

    /// Run in `auto` mode and collapse the result by its shape: nothing for
    /// no rows, the scalar for 1x1, the record for 1xN, the list otherwise.
    pub async fn execute_query(&self, query: &str, params: &[Value]) -> DbResult<Value> {
        let result = self.fetch(query, FetchMode::Auto, params).await?;
        let rows = result.num_rows();
        let mut all = result.fetch_all();
        Ok(match rows {
            0 => Value::Null,
            1 => all.pop().unwrap_or(Value::Null),
            _ => Value::Array(all),
        })
    }

    /// Every row of an `auto` fetch.
    pub async fn execute_query_array(&self, query: &str, params: &[Value]) -> DbResult<Vec<Value>> {
        Ok(self.fetch(query, FetchMode::Auto, params).await?.fetch_all())
    }

    /// `execute_query` read as an integer, 0 when absent.
    pub async fn execute_scalar(&self, query: &str, params: &[Value]) -> DbResult<i64> {
        Ok(intval(&self.execute_query(query, params).await?))
    }

    /// First row decoded into `T`.
    pub async fn fetch_one<T: DeserializeOwned>(
        &self,
        query: &str,
        params: &[Value],
    ) -> DbResult<Option<T>> {
        Ok(self.fetch_all_as(query, params).await?.into_iter().next())
    }

    /// Every row decoded into `T`.
    pub async fn fetch_all_as<T: DeserializeOwned>(
        &self,
        query: &str,
        params: &[Value],
    ) -> DbResult<Vec<T>> {
        self.query(query, params).await?.decode()
    }

    pub async fn disconnect(&self) {
        let driver = match self.driver.write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(driver) = driver {
            driver.disconnect().await;
        }
    }
}

/// Integer reading of a JSON value: numbers truncate, strings use their
/// leading integer, everything else is 0 or 1.
pub fn intval(value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => *b as i64,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            let (sign, rest) = match s.strip_prefix('-') {
                Some(rest) => (-1, rest),
                None => (1, s.strip_prefix('+').unwrap_or(s)),
            };
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<i64>().map(|n| sign * n).unwrap_or(0)
        }
        Value::Array(items) => !items.is_empty() as i64,
        Value::Object(map) => !map.is_empty() as i64,
    }
}

/// Float reading of a JSON value, following the same rules as [`intval`].
pub fn floatval(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let s = s.trim();
            let end = s
                .char_indices()
                .take_while(|(i, c)| {
                    c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))
                })
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(0);
            s[..end].parse::<f64>().unwrap_or(0.0)
        }
        other => intval(other) as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn driver_names_map_to_backends() {
        assert_eq!("pdo_sqlite".parse::<DriverKind>().unwrap(), DriverKind::Sqlite);
        assert_eq!("sqlite3".parse::<DriverKind>().unwrap(), DriverKind::Sqlite);
        assert_eq!("mysqli".parse::<DriverKind>().unwrap(), DriverKind::Mysql);
        let err = "oracle".parse::<DriverKind>().unwrap_err();
        assert_eq!(err.to_string(), "Database type 'oracle' not found");
    }

    #[test]
    fn intval_reads_leading_digits() {
        assert_eq!(intval(&json!("42abc")), 42);
        assert_eq!(intval(&json!("-7")), -7);
        assert_eq!(intval(&json!("abc")), 0);
        assert_eq!(intval(&json!(3.9)), 3);
        assert_eq!(intval(&json!(true)), 1);
        assert_eq!(intval(&Value::Null), 0);
    }

    #[test]
    fn floatval_reads_leading_number() {
        assert_eq!(floatval(&json!("3.5kg")), 3.5);
        assert_eq!(floatval(&json!("x")), 0.0);
        assert_eq!(floatval(&json!(2)), 2.0);
    }

    #[tokio::test]
    async fn disconnected_database_rejects_queries() {
        let db = crate::test_support::memory_db().await;
        db.disconnect().await;
        let err = db.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Disconnected));
        assert!(!db.check("SELECT 1").await);
    }

    #[tokio::test]
    async fn execute_query_collapses_by_shape() {
        let db = crate::test_support::memory_db().await;
        db.query("CREATE TABLE t (id INTEGER, name TEXT)", &[]).await.unwrap();
        db.query("INSERT INTO t VALUES (1, 'a'), (2, 'b')", &[]).await.unwrap();

        assert_eq!(db.execute_query("SELECT id FROM t WHERE id = 9", &[]).await.unwrap(), Value::Null);
        assert_eq!(db.execute_query("SELECT name FROM t WHERE id = ?", &[json!(2)]).await.unwrap(), json!("b"));
        assert_eq!(
            db.execute_query("SELECT id, name FROM t WHERE id = 1", &[]).await.unwrap(),
            json!({"id": 1, "name": "a"})
        );
        assert_eq!(db.execute_query("SELECT id FROM t ORDER BY id", &[]).await.unwrap(), json!([1, 2]));
        assert_eq!(
            db.execute_query("SELECT id, name FROM t ORDER BY id", &[]).await.unwrap(),
            json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])
        );
        assert_eq!(db.execute_scalar("SELECT MAX(id) FROM t", &[]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fetch_modes_through_the_driver() {
        let db = crate::test_support::memory_db().await;
        db.query("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();
        db.query("INSERT INTO t VALUES (1), (2), (3)", &[]).await.unwrap();

        let concat = db.fetch("SELECT id FROM t ORDER BY id", FetchMode::Concat, &[]).await.unwrap();
        assert_eq!(concat.rows, Rows::Concat(vec!["1,2,3".into()]));

        let column = db.fetch("SELECT id FROM t WHERE id > 5", FetchMode::Column, &[]).await.unwrap();
        assert_eq!(column.total, 0);
        assert_eq!(column.header, vec!["column"]);

        let insert = db.query("INSERT INTO t VALUES (4)", &[]).await.unwrap();
        assert_eq!(insert, QueryResult::empty());
    }
}
