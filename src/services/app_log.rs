//! Audit trail of app rows, kept in `<table>_log`.
//!
//! An entry names one row in `reg_id` or several in the comma separated
//! `reg_ids`, never both. `extra_id` and `extra_ids` follow the same rule.

use crate::{
    datetime::current_datetime,
    db::{Database, Record, intval, record},
    sql::{find_in_set, prepare_insert_query},
};
use serde_json::{Value, json};
use tracing::debug;

use super::{ServiceResult, apps::Apps};

/// `(id, "")` for one id, `(0, "a,b,...")` for several, `(0, "")` for none.
fn pack_ids(ids: &[i64]) -> (i64, String) {
    match ids {
        [] => (0, String::new()),
        [id] => (*id, String::new()),
        ids => (0, ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")),
    }
}

/// The log table of `app`, when it exists.
async fn log_table(db: &Database, apps: &Apps, app: &str) -> ServiceResult<Option<String>> {
    let table = format!("{}_log", apps.app2table(app)?);
    if db.check(&format!("SELECT id FROM {} LIMIT 1", table)).await {
        Ok(Some(table))
    } else {
        Ok(None)
    }
}

/// Append `log` for `reg_ids` to the trail of `app`. Returns false when the
/// app has no log table.
pub async fn make_log(
    db: &Database,
    apps: &Apps,
    app: &str,
    user_id: i64,
    log: &str,
    reg_ids: &[i64],
    extra_ids: &[i64],
) -> ServiceResult<bool> {
    let Some(table) = log_table(db, apps, app).await? else {
        return Ok(false);
    };
    let (reg_id, reg_ids) = pack_ids(reg_ids);
    let (extra_id, extra_ids) = pack_ids(extra_ids);
    let entry = record(json!({
        "user_id": user_id,
        "datetime": current_datetime(0),
        "log": log,
        "reg_id": reg_id,
        "reg_ids": reg_ids,
        "extra_id": extra_id,
        "extra_ids": extra_ids,
    }));
    let (query, params) = prepare_insert_query(db, &table, &entry).await?;
    db.query(&query, &params).await?;
    debug!("logged {} on {}", log, app);
    Ok(true)
}

/// [`make_log`] for the `id` of a row, or the ids of a list of rows, when
/// the app keeps a trail.
pub async fn make_log_bypass(
    db: &Database,
    apps: &Apps,
    app: &str,
    user_id: i64,
    log: &str,
    data: &Value,
) -> ServiceResult<bool> {
    if !apps.app2log(app)? {
        return Ok(false);
    }
    let ids: Vec<i64> = match data {
        Value::Object(row) if row.contains_key("id") => vec![intval(&row["id"])],
        Value::Array(rows) => rows
            .iter()
            .filter_map(|row| row.get("id"))
            .map(intval)
            .collect(),
        _ => Vec::new(),
    };
    if ids.is_empty() {
        return Ok(false);
    }
    make_log(db, apps, app, user_id, log, &ids, &[]).await
}

/// Entries that name `reg_id`, alone or in a list, oldest first. `None`
/// when the app has no log table.
pub async fn get_logs(db: &Database, apps: &Apps, app: &str, reg_id: i64) -> ServiceResult<Option<Vec<Record>>> {
    let Some(table) = log_table(db, apps, app).await? else {
        return Ok(None);
    };
    let rows = db
        .query(
            &format!(
                "SELECT id, user_id, datetime, log, reg_id, extra_id, reg_ids, extra_ids
                FROM {} WHERE reg_id = ? OR {} ORDER BY id ASC",
                table,
                find_in_set(reg_id, "reg_ids")
            ),
            &[json!(reg_id)],
        )
        .await?
        .into_records();
    Ok(Some(
        rows.into_iter()
            .map(|mut row| {
                for column in ["reg_id", "extra_id"] {
                    if row.get(column).is_some_and(|value| intval(value) == 0) {
                        row.insert(column.into(), json!(""));
                    }
                }
                row
            })
            .collect(),
    ))
}

/// Drop the newest entry whose `reg_id` is `reg_id`. Returns false when
/// there is no log table or no such entry.
pub async fn del_log(db: &Database, apps: &Apps, app: &str, reg_id: i64) -> ServiceResult<bool> {
    let Some(table) = log_table(db, apps, app).await? else {
        return Ok(false);
    };
    let log_id = db
        .execute_scalar(&format!("SELECT MAX(id) FROM {} WHERE reg_id = ?", table), &[json!(reg_id)])
        .await?;
    if log_id == 0 {
        return Ok(false);
    }
    db.query(&format!("DELETE FROM {} WHERE id = ?", table), &[json!(log_id)])
        .await?;
    Ok(true)
}
