//! Users, their password history and their tokens.

use serde::{Deserialize, Serialize};

/// A row of `tbl_users`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct User {
    pub id: i64,
    pub active: i64,
    /// Primary group.
    pub group_id: i64,
    /// Extra groups as a comma separated id list.
    pub groups_id: Option<String>,
    pub login: String,
    pub name: Option<String>,
    /// Daily access window; `start = end` means no access at all.
    pub start: Option<String>,
    pub end: Option<String>,
    /// Seven `0`/`1` flags, Sunday first.
    pub days: Option<String>,
}

/// A row of `tbl_users_passwords`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Password {
    pub id: i64,
    pub active: i64,
    pub user_id: i64,
    pub created_at: String,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    /// argon2 PHC string, or a legacy md5 hex digest.
    pub password: String,
    pub expires_at: String,
}

/// A row of `tbl_users_tokens`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Token {
    pub id: i64,
    pub active: i64,
    pub user_id: i64,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub token: String,
    pub expires_at: String,
}
