//! Rows of the framework tables.
//!
//! Rows are decoded from [`QueryResult`](crate::db::QueryResult) records
//! through `serde`, so the same structs serve every database backend.

pub mod app;
pub mod upload;
pub mod user;
