//! Registry of the apps declared in `tbl_apps`.

use crate::{db::Database, models::app::AppRow};
use serde::Serialize;

use super::{ServiceError, ServiceResult};

/// A dependent table of an app, linked to the app row through `field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subtable {
    /// Key under which the subtable rows travel in the app data.
    pub alias: String,
    pub subtable: String,
    pub field: String,
}

/// Parse comma separated `alias:subtable(field)` or `subtable(field)` specs.
pub fn parse_subtables(spec: &str) -> Vec<Subtable> {
    spec.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (alias, rest) = match item.split_once(':') {
                Some((alias, rest)) if !alias.is_empty() => (alias.to_string(), rest),
                _ => (String::new(), item),
            };
            let (subtable, field) = match rest.split_once('(') {
                Some((subtable, field)) => (subtable, field.trim_end_matches(')')),
                None => (rest, ""),
            };
            Subtable {
                alias,
                subtable: subtable.trim().to_string(),
                field: field.trim().to_string(),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct AppEntry {
    row: AppRow,
    table: String,
    subtables: Vec<Subtable>,
}

#[derive(Debug, Clone, Default)]
pub struct Apps {
    entries: Vec<AppEntry>,
}

#[track_caller]
fn not_found(function: &str, arg: impl std::fmt::Display) -> ServiceError {
    ServiceError::internal(format!("{}({}) not found", function, arg))
}

impl Apps {
    /// Load the active apps.
    pub async fn load(db: &Database) -> ServiceResult<Self> {
        let rows = db
            .fetch_all_as::<AppRow>("SELECT * FROM tbl_apps WHERE active = 1", &[])
            .await?;
        Ok(Self::from_rows(rows))
    }

    pub fn from_rows(rows: Vec<AppRow>) -> Self {
        let entries = rows
            .into_iter()
            .map(|row| AppEntry {
                table: row.table.clone().unwrap_or_default(),
                subtables: parse_subtables(row.subtables.as_deref().unwrap_or_default()),
                row,
            })
            .collect();
        Self { entries }
    }

    fn by_app(&self, app: &str) -> Option<&AppEntry> {
        self.entries.iter().find(|entry| entry.row.code == app)
    }

    fn by_table(&self, table: &str) -> Option<&AppEntry> {
        self.entries
            .iter()
            .find(|entry| !entry.table.is_empty() && entry.table == table)
    }

    fn by_subtable(&self, subtable: &str) -> Option<&AppEntry> {
        self.entries
            .iter()
            .find(|entry| entry.subtables.iter().any(|s| s.subtable == subtable))
    }

    #[track_caller]
    fn entry(&self, function: &str, app: &str) -> ServiceResult<&AppEntry> {
        self.by_app(app).ok_or_else(|| not_found(function, app))
    }

    pub fn app_exists(&self, app: &str) -> bool {
        self.by_app(app).is_some()
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.by_table(table).is_some()
    }

    pub fn subtable_exists(&self, subtable: &str) -> bool {
        self.by_subtable(subtable).is_some()
    }

    pub fn row(&self, app: &str) -> ServiceResult<&AppRow> {
        Ok(&self.entry("app2row", app)?.row)
    }

    pub fn id2app(&self, id: i64) -> ServiceResult<&str> {
        self.entries
            .iter()
            .find(|entry| entry.row.id == id)
            .map(|entry| entry.row.code.as_str())
            .ok_or_else(|| not_found("id2app", id))
    }

    pub fn app2id(&self, app: &str) -> ServiceResult<i64> {
        Ok(self.entry("app2id", app)?.row.id)
    }

    pub fn app2table(&self, app: &str) -> ServiceResult<&str> {
        Ok(self.entry("app2table", app)?.table.as_str())
    }

    pub fn table2app(&self, table: &str) -> ServiceResult<&str> {
        self.by_table(table)
            .map(|entry| entry.row.code.as_str())
            .ok_or_else(|| not_found("table2app", table))
    }

    pub fn app2subtables(&self, app: &str) -> ServiceResult<&[Subtable]> {
        Ok(&self.entry("app2subtables", app)?.subtables)
    }

    pub fn subtable2app(&self, subtable: &str) -> ServiceResult<&str> {
        self.by_subtable(subtable)
            .map(|entry| entry.row.code.as_str())
            .ok_or_else(|| not_found("subtable2app", subtable))
    }

    pub fn app2index(&self, app: &str) -> ServiceResult<bool> {
        Ok(self.entry("app2index", app)?.row.has_index != 0)
    }

    pub fn app2control(&self, app: &str) -> ServiceResult<bool> {
        Ok(self.entry("app2control", app)?.row.has_control != 0)
    }

    pub fn app2version(&self, app: &str) -> ServiceResult<bool> {
        Ok(self.entry("app2version", app)?.row.has_version != 0)
    }

    pub fn app2files(&self, app: &str) -> ServiceResult<bool> {
        Ok(self.entry("app2files", app)?.row.has_files != 0)
    }

    pub fn app2notes(&self, app: &str) -> ServiceResult<bool> {
        Ok(self.entry("app2notes", app)?.row.has_notes != 0)
    }

    pub fn app2log(&self, app: &str) -> ServiceResult<bool> {
        Ok(self.entry("app2log", app)?.row.has_log != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> AppRow {
        AppRow {
            id: 10,
            active: 1,
            code: "customers".into(),
            table: Some("app_customers".into()),
            subtables: Some("addresses:app_customers_addresses(customer_id),app_customers_notes(reg_id)".into()),
            has_index: 1,
            has_version: 1,
            ..AppRow::default()
        }
    }

    #[test]
    fn subtable_specs() {
        let parsed = parse_subtables("a:t1(f1), t2(f2),,");
        assert_eq!(
            parsed,
            vec![
                Subtable { alias: "a".into(), subtable: "t1".into(), field: "f1".into() },
                Subtable { alias: String::new(), subtable: "t2".into(), field: "f2".into() },
            ]
        );
        assert!(parse_subtables("").is_empty());
    }

    #[test]
    fn lookups_in_both_directions() {
        let apps = Apps::from_rows(vec![customers()]);
        assert_eq!(apps.app2id("customers").unwrap(), 10);
        assert_eq!(apps.id2app(10).unwrap(), "customers");
        assert_eq!(apps.app2table("customers").unwrap(), "app_customers");
        assert_eq!(apps.table2app("app_customers").unwrap(), "customers");
        assert_eq!(apps.subtable2app("app_customers_addresses").unwrap(), "customers");
        assert_eq!(apps.app2subtables("customers").unwrap().len(), 2);
        assert!(apps.app2index("customers").unwrap());
        assert!(!apps.app2control("customers").unwrap());
        assert!(apps.app_exists("customers"));
        assert!(apps.table_exists("app_customers"));
        assert!(apps.subtable_exists("app_customers_notes"));
        assert!(!apps.app_exists("invoices"));
    }

    #[test]
    fn missing_keys_name_the_lookup() {
        let apps = Apps::from_rows(vec![customers()]);
        let err = apps.app2table("invoices").unwrap_err();
        assert_eq!(err.to_string(), "app2table(invoices) not found");
        assert_eq!(apps.id2app(99).unwrap_err().to_string(), "id2app(99) not found");
    }
}
