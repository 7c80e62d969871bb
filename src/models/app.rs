//! Registered apps and the permission catalogue.

use serde::{Deserialize, Serialize};

/// A row of `tbl_apps`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AppRow {
    pub id: i64,
    pub active: i64,
    pub code: String,
    pub name: Option<String>,
    pub table: Option<String>,
    /// Comma separated `alias:subtable(field)` specs.
    pub subtables: Option<String>,
    pub has_index: i64,
    pub has_control: i64,
    pub has_version: i64,
    pub has_files: i64,
    pub has_notes: i64,
    pub has_log: i64,
}

/// A row of `tbl_perms`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PermRow {
    pub id: i64,
    pub code: String,
    /// `all`, `group`, `user` or empty for perms without owner variants.
    pub owner: Option<String>,
}

/// One grant of `tbl_apps_perms`, `tbl_users_apps_perms` or
/// `tbl_groups_apps_perms`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GrantRow {
    pub app_id: i64,
    pub perm_id: i64,
    pub allow: i64,
    pub deny: i64,
}
