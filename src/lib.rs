//! SaltOS backend: JSON actions over a relational database.

pub mod config;
pub mod datetime;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod sql;
pub mod text;
pub mod tokens;

use axum::Router;
use db::{Database, DbResult};
use services::AppState;
use tracing::{debug, info};

/// Schema and seed data, written with dialect comments.
pub const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Statements of a migration script: `--` comment lines dropped, split on `;`.
pub fn migration_statements(script: &str) -> Vec<String> {
    let body: String = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    body.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply [`INIT_SQL`]. Every statement is idempotent.
pub async fn migrate(db: &Database) -> DbResult<usize> {
    let statements = migration_statements(INIT_SQL);
    info!("Running {} migration statements...", statements.len());
    for statement in &statements {
        debug!("Executing migration SQL: {}", statement);
        db.query(statement, &[]).await?;
    }
    Ok(statements.len())
}

/// The HTTP application.
pub fn create_app(state: AppState) -> Router {
    routes::routes::routes().with_state(state)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_script_splits_into_statements() {
        let statements = migration_statements("-- a; comment\nCREATE TABLE a (id INTEGER);\n\nSELECT 1;");
        assert_eq!(statements, vec!["CREATE TABLE a (id INTEGER)", "SELECT 1"]);
        assert!(migration_statements(INIT_SQL).len() > 10);
    }

    #[tokio::test]
    async fn migration_is_repeatable() {
        let db = test_support::memory_db().await;
        let first = migrate(&db).await.unwrap();
        assert_eq!(migrate(&db).await.unwrap(), first);
        let apps = db.execute_scalar("SELECT COUNT(*) FROM tbl_apps", &[]).await.unwrap();
        assert_eq!(apps, 1);
    }
}
