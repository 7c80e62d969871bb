//! Permission resolution for apps.
//!
//! `tbl_apps_perms` lists which perms each app exposes. User and group grants
//! add their `allow`/`deny` counters on top; a perm is granted when the sum of
//! `allow` is positive and no `deny` was added. Perms with an owner (`all`,
//! `group`, `user`) are addressed as `code|owner`.

use crate::{
    db::Database,
    models::app::{GrantRow, PermRow},
    sql::find_in_set,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::{ServiceError, ServiceResult, apps::Apps, auth_service::Caller};

/// Owner variants checked by [`Access::check_sql`], in output order.
const OWNERS: [&str; 3] = ["all", "group", "user"];

#[derive(Debug, Clone, Default)]
pub struct Perms {
    rows: Vec<PermRow>,
}

impl Perms {
    pub async fn load(db: &Database) -> ServiceResult<Self> {
        let rows = db
            .fetch_all_as::<PermRow>("SELECT * FROM tbl_perms WHERE active = 1", &[])
            .await?;
        Ok(Self { rows })
    }

    pub fn from_rows(rows: Vec<PermRow>) -> Self {
        Self { rows }
    }

    fn name(row: &PermRow) -> String {
        match row.owner.as_deref() {
            Some(owner) if !owner.is_empty() => format!("{}|{}", row.code, owner),
            _ => row.code.clone(),
        }
    }

    pub fn perm_exists(&self, perm: &str) -> bool {
        !self.perm2id(perm).is_empty()
    }

    /// Ids behind `perm`: one for `code|owner` or an owner-less code, every
    /// owner variant for a bare code that has them.
    pub fn perm2id(&self, perm: &str) -> Vec<i64> {
        let exact: Vec<i64> = self
            .rows
            .iter()
            .filter(|row| Self::name(row) == perm)
            .map(|row| row.id)
            .collect();
        if !exact.is_empty() {
            return exact;
        }
        self.rows
            .iter()
            .filter(|row| row.code == perm && row.owner.as_deref().is_some_and(|o| !o.is_empty()))
            .map(|row| row.id)
            .collect()
    }

    #[track_caller]
    pub fn id2perm(&self, id: i64) -> ServiceResult<String> {
        self.rows
            .iter()
            .find(|row| row.id == id)
            .map(Self::name)
            .ok_or_else(|| ServiceError::internal(format!("id2perm({}) not found", id)))
    }
}

/// Permissions of one caller, resolved once per request.
#[derive(Clone)]
pub struct Access {
    db: Database,
    apps: Apps,
    perms: Perms,
    granted: HashSet<(i64, i64)>,
    user_id: i64,
    group_ids: Vec<i64>,
}

fn parse_ids(list: &str) -> Vec<i64> {
    list.split(',')
        .filter_map(|id| id.trim().parse::<i64>().ok())
        .collect()
}

fn id_list(ids: &[i64]) -> String {
    if ids.is_empty() {
        return "0".to_string();
    }
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}

impl Access {
    pub async fn load(caller: &Caller) -> ServiceResult<Self> {
        let db = caller.state().db.clone();
        let apps = Apps::load(&db).await?;
        let perms = Perms::load(&db).await?;
        let user_id = caller.current_user().await?;
        let group_ids = parse_ids(&caller.current_groups().await?);

        let base = db
            .fetch_all_as::<GrantRow>("SELECT app_id, perm_id, allow, deny FROM tbl_apps_perms", &[])
            .await?;
        let from_user = db
            .fetch_all_as::<GrantRow>(
                "SELECT app_id, perm_id, allow, deny FROM tbl_users_apps_perms WHERE user_id = ?",
                &[json!(user_id)],
            )
            .await?;
        let from_groups = db
            .fetch_all_as::<GrantRow>(
                &format!(
                    "SELECT app_id, perm_id, allow, deny FROM tbl_groups_apps_perms WHERE group_id IN ({})",
                    id_list(&group_ids)
                ),
                &[],
            )
            .await?;

        let granted = resolve_grants(base, from_user.into_iter().chain(from_groups))?;
        debug!("user {} holds {} grants", user_id, granted.len());
        Ok(Self {
            db,
            apps,
            perms,
            granted,
            user_id,
            group_ids,
        })
    }

    pub fn apps(&self) -> &Apps {
        &self.apps
    }

    pub fn perms(&self) -> &Perms {
        &self.perms
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Whether the caller holds `perm` on `app`. Unknown apps or perms are
    /// errors; for a bare code with owner variants any variant suffices.
    #[track_caller]
    pub fn check_user(&self, app: &str, perm: &str) -> ServiceResult<bool> {
        if !self.apps.app_exists(app) {
            return Err(ServiceError::internal(format!("App {} not found", app)));
        }
        let perm_ids = self.perms.perm2id(perm);
        if perm_ids.is_empty() {
            return Err(ServiceError::internal(format!("Perm {} not found", perm)));
        }
        let app_id = self.apps.app2id(app)?;
        Ok(perm_ids
            .iter()
            .any(|perm_id| self.granted.contains(&(app_id, *perm_id))))
    }

    /// Row filter over `app` for `perm`: `1=1` with the `all` variant,
    /// otherwise the OR of the `group` and `user` ownership filters, `1=0`
    /// when nothing is granted.
    pub fn check_sql(&self, app: &str, perm: &str) -> ServiceResult<String> {
        let table = self.apps.app2table(app)?;
        let mut filters = Vec::new();
        for owner in OWNERS {
            if !self.check_user(app, &format!("{}|{}", perm, owner))? {
                continue;
            }
            match owner {
                "all" => return Ok("1=1".to_string()),
                "group" => {
                    let mut terms = vec![format!("group_id IN ({})", id_list(&self.group_ids))];
                    terms.extend(self.group_ids.iter().map(|id| find_in_set(*id, "groups_id")));
                    filters.push(format!(
                        "id IN (SELECT id FROM {}_control WHERE {})",
                        table,
                        terms.join(" OR ")
                    ));
                }
                _ => filters.push(format!(
                    "id IN (SELECT id FROM {}_control WHERE user_id IN ({}) OR {})",
                    table,
                    self.user_id,
                    find_in_set(self.user_id, "users_id")
                )),
            }
        }
        if filters.is_empty() {
            return Ok("1=0".to_string());
        }
        Ok(format!("({})", filters.join(" OR ")))
    }

    /// [`check_user`](Self::check_user), then, with an id, the row must be
    /// visible under [`check_sql`](Self::check_sql).
    pub async fn check_app_perm_id(&self, app: &str, perm: &str, id: Option<i64>) -> ServiceResult<bool> {
        if !self.check_user(app, perm)? {
            return Ok(false);
        }
        let Some(id) = id else {
            return Ok(true);
        };
        let table = self.apps.app2table(app)?;
        let filter = self.check_sql(app, perm)?;
        let found = self
            .db
            .execute_scalar(
                &format!("SELECT id FROM {} WHERE id = ? AND {}", table, filter),
                &[json!(id)],
            )
            .await?;
        Ok(found != 0)
    }

    /// Perm names the caller holds on `app`, as reported by the `app` action.
    pub fn granted_perms(&self, app: &str) -> ServiceResult<Vec<String>> {
        let app_id = self.apps.app2id(app)?;
        let mut names: Vec<String> = self
            .granted
            .iter()
            .filter(|(granted_app, _)| *granted_app == app_id)
            .filter_map(|(_, perm_id)| self.perms.id2perm(*perm_id).ok())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Sum grants onto the perms each app exposes and keep the granted pairs.
fn resolve_grants(
    base: Vec<GrantRow>,
    extra: impl IntoIterator<Item = GrantRow>,
) -> ServiceResult<HashSet<(i64, i64)>> {
    let mut table: BTreeMap<(i64, i64), (i64, i64)> = base
        .into_iter()
        .map(|row| ((row.app_id, row.perm_id), (row.allow, row.deny)))
        .collect();
    for row in extra {
        let Some((allow, deny)) = table.get_mut(&(row.app_id, row.perm_id)) else {
            return Err(ServiceError::internal(format!(
                "Internal error for {}|{}",
                row.app_id, row.perm_id
            )));
        };
        *allow += row.allow;
        *deny += row.deny;
    }
    Ok(table
        .into_iter()
        .filter(|(_, (allow, deny))| *allow > 0 && *deny == 0)
        .map(|(key, _)| key)
        .collect())
}
