//! Hash-chained history of app rows.
//!
//! Every version stores, per table and row id, the columns that changed since
//! the merged state of the previous versions. A table listed in a version
//! with some rows missing means those rows were removed. Each version hashes
//! its own fields together with the previous hash, so replaying the chain
//! detects edited or reordered entries.

use crate::{
    datetime::current_datetime,
    db::{Database, Record, intval, result::scalar_to_string},
    sql::prepare_insert_query,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::debug;

use super::{AppState, ServiceError, ServiceResult, apps::Apps};

/// Table name to row id to columns.
pub type VersionData = BTreeMap<String, BTreeMap<String, Record>>;

/// Tables whose rows belong to the history of one app row, with the column
/// linking them to the row id. Control, files and notes tables count only
/// when the app enables them and the table exists.
async fn tracked_tables(db: &Database, apps: &Apps, app: &str) -> ServiceResult<Vec<(String, String)>> {
    let table = apps.app2table(app)?;
    let mut tables = vec![(table.to_string(), "id".to_string())];
    for subtable in apps.app2subtables(app)? {
        tables.push((subtable.subtable.clone(), subtable.field.clone()));
    }
    let optional = [
        (apps.app2control(app)?, "control", "id"),
        (apps.app2files(app)?, "files", "reg_id"),
        (apps.app2notes(app)?, "notes", "reg_id"),
    ];
    for (enabled, suffix, field) in optional {
        let tracked = format!("{}_{}", table, suffix);
        if enabled && db.check(&format!("SELECT id FROM {} LIMIT 1", tracked)).await {
            tables.push((tracked, field.to_string()));
        }
    }
    Ok(tables)
}

/// Columns kept out of the history of a tracked table.
fn untracked_columns(tracked: &str) -> &'static [&'static str] {
    if tracked.ends_with("_files") { &["search"] } else { &[] }
}

fn row_key(row: &Record) -> String {
    row.get("id").map(scalar_to_string).unwrap_or_default()
}

/// Hash of one chain entry; `hash` is the hash of the previous entry.
fn chain_hash(user_id: i64, datetime: &str, reg_id: i64, ver_id: i64, data: &str, hash: &str) -> String {
    let canonical = json!({
        "user_id": user_id,
        "datetime": datetime,
        "reg_id": reg_id,
        "ver_id": ver_id,
        "data": data,
        "hash": hash,
    });
    format!("{:x}", md5::compute(canonical.to_string()))
}

/// Columns of `new` that are missing from `old` or hold another value.
fn diff_row(new: &Record, old: Option<&Record>) -> Record {
    new.iter()
        .filter(|(column, value)| {
            old.and_then(|old| old.get(*column))
                .is_none_or(|previous| scalar_to_string(previous) != scalar_to_string(value))
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

fn encode_data(data: &VersionData) -> ServiceResult<String> {
    let text = serde_json::to_string(data)
        .map_err(|err| ServiceError::internal(format!("Could not encode version data: {}", err)))?;
    Ok(BASE64.encode(text))
}

fn decode_data(data: &str) -> Option<VersionData> {
    let bytes = BASE64.decode(data).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Append a version of `reg_id` to the history of `app`.
///
/// Returns false when the app keeps no history or when the row never
/// existed. A row that is gone but has history gets a version that removes
/// it from every tracked table.
pub async fn make_version(state: &AppState, apps: &Apps, app: &str, reg_id: i64, user_id: i64) -> ServiceResult<bool> {
    if !apps.app2version(app)? {
        return Ok(false);
    }
    let table = apps.app2table(app)?.to_string();
    let _guard = state
        .semaphores
        .acquire(&format!("{}_{}", app, reg_id), state.config.semaphore_timeout)
        .await?;
    let db = &state.db;

    let last = db
        .fetch_one::<Record>(
            &format!(
                "SELECT ver_id, hash FROM {}_version WHERE reg_id = ? ORDER BY id DESC LIMIT 1",
                table
            ),
            &[json!(reg_id)],
        )
        .await?;
    let exists = db
        .execute_scalar(&format!("SELECT id FROM {} WHERE id = ?", table), &[json!(reg_id)])
        .await?
        != 0;
    if !exists && last.is_none() {
        return Ok(false);
    }

    let old = match last {
        Some(_) => get_version(db, apps, app, reg_id, None).await?,
        None => VersionData::new(),
    };
    let mut data = VersionData::new();
    for (tracked, field) in tracked_tables(db, apps, app).await? {
        let mut rows = BTreeMap::new();
        if exists {
            let current = db
                .query(
                    &format!("SELECT * FROM {} WHERE {} = ? ORDER BY id", tracked, field),
                    &[json!(reg_id)],
                )
                .await?
                .into_records();
            let previous = old.get(&tracked);
            for mut row in current {
                for column in untracked_columns(&tracked) {
                    row.remove(*column);
                }
                let key = row_key(&row);
                let diff = diff_row(&row, previous.and_then(|rows| rows.get(&key)));
                rows.insert(key, diff);
            }
        }
        data.insert(tracked, rows);
    }

    let (ver_id, hash_old) = last
        .map(|row| {
            (
                intval(row.get("ver_id").unwrap_or(&Value::Null)),
                row.get("hash").map(scalar_to_string).unwrap_or_default(),
            )
        })
        .unwrap_or_default();
    let ver_id = ver_id + 1;
    let datetime = current_datetime(0);
    let encoded = encode_data(&data)?;
    let hash = chain_hash(user_id, &datetime, reg_id, ver_id, &encoded, &hash_old);

    let mut entry = Map::new();
    entry.insert("user_id".into(), json!(user_id));
    entry.insert("datetime".into(), json!(datetime));
    entry.insert("reg_id".into(), json!(reg_id));
    entry.insert("ver_id".into(), json!(ver_id));
    entry.insert("data".into(), json!(encoded));
    entry.insert("hash".into(), json!(hash));
    let (query, params) = prepare_insert_query(db, &format!("{}_version", table), &entry).await?;
    db.query(&query, &params).await?;
    debug!("stored version {} of {}:{}", ver_id, app, reg_id);
    Ok(true)
}

/// Merged state of `reg_id` at `ver_id`, or at the last version.
///
/// Fails when the chain is broken: a hash mismatch, a datetime older than
/// the previous entry or a gap in `ver_id`.
pub async fn get_version(
    db: &Database,
    apps: &Apps,
    app: &str,
    reg_id: i64,
    ver_id: Option<i64>,
) -> ServiceResult<VersionData> {
    let table = apps.app2table(app)?;
    let rows = db
        .query(
            &format!("SELECT * FROM {}_version WHERE reg_id = ? ORDER BY id ASC", table),
            &[json!(reg_id)],
        )
        .await?
        .into_records();
    let mut merged = VersionData::new();
    let mut hash_old = String::new();
    let mut datetime_old = String::new();
    let mut version_old = 0;
    for row in rows {
        let user_id = intval(row.get("user_id").unwrap_or(&Value::Null));
        let row_reg_id = intval(row.get("reg_id").unwrap_or(&Value::Null));
        let row_ver_id = intval(row.get("ver_id").unwrap_or(&Value::Null));
        let datetime = row.get("datetime").map(scalar_to_string).unwrap_or_default();
        let data = row.get("data").map(scalar_to_string).unwrap_or_default();
        let hash = row.get("hash").map(scalar_to_string).unwrap_or_default();

        let broken = || {
            ServiceError::internal(format!(
                "Blockchain integrity break for {}:{}:{}",
                app, reg_id, row_ver_id
            ))
        };
        if hash != chain_hash(user_id, &datetime, row_reg_id, row_ver_id, &data, &hash_old) {
            return Err(broken());
        }
        if datetime < datetime_old || row_ver_id != version_old + 1 {
            return Err(broken());
        }
        let Some(changes) = decode_data(&data) else {
            return Err(broken());
        };

        for (tracked, rows) in changes {
            let state = merged.entry(tracked).or_default();
            state.retain(|key, _| rows.contains_key(key));
            for (key, columns) in rows {
                state.entry(key).or_default().extend(columns);
            }
        }

        hash_old = hash;
        datetime_old = datetime;
        version_old = row_ver_id;
        if Some(row_ver_id) == ver_id {
            return Ok(merged);
        }
    }
    match ver_id {
        Some(wanted) => Err(ServiceError::internal(format!(
            "Version {}:{}:{} not found",
            app, reg_id, wanted
        ))),
        None => Ok(merged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestApp;

    async fn seed(app: &TestApp) -> Apps {
        app.state
            .db
            .query("INSERT INTO app_customers (id, name, city) VALUES (1, 'Acme', 'Reus')", &[])
            .await
            .unwrap();
        app.state
            .db
            .query(
                "INSERT INTO app_customers_addresses (id, customer_id, street) VALUES (10, 1, 'Main St')",
                &[],
            )
            .await
            .unwrap();
        Apps::load(&app.state.db).await.unwrap()
    }

    #[test]
    fn diff_keeps_changed_and_new_columns() {
        let old = crate::db::record(json!({"id": 1, "name": "Acme", "city": "Reus"}));
        let new = crate::db::record(json!({"id": "1", "name": "Acme", "city": "Tarragona"}));
        assert_eq!(Value::Object(diff_row(&new, Some(&old))), json!({"city": "Tarragona"}));
        assert_eq!(diff_row(&new, None).len(), 3);
    }

    #[tokio::test]
    async fn chain_replays_changes_and_removals() {
        let app = TestApp::new().await;
        let apps = seed(&app).await;
        let db = &app.state.db;

        assert!(make_version(&app.state, &apps, "customers", 1, 1).await.unwrap());
        db.query("UPDATE app_customers SET city = 'Tarragona' WHERE id = 1", &[]).await.unwrap();
        db.query("DELETE FROM app_customers_addresses WHERE id = 10", &[]).await.unwrap();
        assert!(make_version(&app.state, &apps, "customers", 1, 1).await.unwrap());

        let first = get_version(db, &apps, "customers", 1, Some(1)).await.unwrap();
        assert_eq!(first["app_customers"]["1"]["city"], "Reus");
        assert!(first["app_customers_addresses"].contains_key("10"));

        let last = get_version(db, &apps, "customers", 1, None).await.unwrap();
        assert_eq!(last["app_customers"]["1"]["city"], "Tarragona");
        assert_eq!(last["app_customers"]["1"]["name"], "Acme");
        assert!(last["app_customers_addresses"].is_empty());

        let stored = db
            .execute_query("SELECT data FROM app_customers_version WHERE ver_id = 2", &[])
            .await
            .unwrap();
        let delta = decode_data(stored.as_str().unwrap()).unwrap();
        assert_eq!(Value::Object(delta["app_customers"]["1"].clone()), json!({"city": "Tarragona"}));
    }

    #[tokio::test]
    async fn deleted_rows_get_an_empty_version() {
        let app = TestApp::new().await;
        let apps = seed(&app).await;
        let db = &app.state.db;

        assert!(!make_version(&app.state, &apps, "customers", 2, 1).await.unwrap());
        make_version(&app.state, &apps, "customers", 1, 1).await.unwrap();
        db.query("DELETE FROM app_customers WHERE id = 1", &[]).await.unwrap();
        assert!(make_version(&app.state, &apps, "customers", 1, 1).await.unwrap());
        let last = get_version(db, &apps, "customers", 1, None).await.unwrap();
        assert!(last["app_customers"].is_empty());
    }

    #[tokio::test]
    async fn files_and_notes_join_the_history_when_enabled() {
        let app = TestApp::new().await;
        let db = &app.state.db;
        db.query("UPDATE tbl_apps SET has_files = 1, has_notes = 1 WHERE code = 'customers'", &[])
            .await
            .unwrap();
        let apps = seed(&app).await;
        db.query(
            "INSERT INTO app_customers_files (id, user_id, datetime, reg_id, name, size, search)
            VALUES (5, 1, '2024-01-01 00:00:00', 1, 'contract.pdf', 42, 'contract pdf')",
            &[],
        )
        .await
        .unwrap();
        db.query(
            "INSERT INTO app_customers_notes (id, user_id, datetime, reg_id, note)
            VALUES (7, 1, '2024-01-01 00:00:00', 1, 'call back')",
            &[],
        )
        .await
        .unwrap();

        assert!(make_version(&app.state, &apps, "customers", 1, 1).await.unwrap());
        db.query("UPDATE app_customers_notes SET note = 'called' WHERE id = 7", &[])
            .await
            .unwrap();
        db.query("DELETE FROM app_customers_files WHERE id = 5", &[]).await.unwrap();
        assert!(make_version(&app.state, &apps, "customers", 1, 1).await.unwrap());

        let first = get_version(db, &apps, "customers", 1, Some(1)).await.unwrap();
        let file = &first["app_customers_files"]["5"];
        assert_eq!(file["name"], "contract.pdf");
        assert!(!file.contains_key("search"));
        assert_eq!(first["app_customers_notes"]["7"]["note"], "call back");

        let last = get_version(db, &apps, "customers", 1, None).await.unwrap();
        assert!(last["app_customers_files"].is_empty());
        assert_eq!(last["app_customers_notes"]["7"]["note"], "called");
        assert_eq!(last["app_customers_notes"]["7"]["reg_id"], 1);
    }

    #[tokio::test]
    async fn enabled_tables_that_do_not_exist_are_skipped() {
        let app = TestApp::new().await;
        let db = &app.state.db;
        db.query("UPDATE tbl_apps SET has_notes = 1 WHERE code = 'customers'", &[])
            .await
            .unwrap();
        db.query("DROP TABLE app_customers_notes", &[]).await.unwrap();
        let apps = seed(&app).await;

        assert!(make_version(&app.state, &apps, "customers", 1, 1).await.unwrap());
        let last = get_version(db, &apps, "customers", 1, None).await.unwrap();
        assert!(!last.contains_key("app_customers_notes"));
        assert!(!last.contains_key("app_customers_files"));
        assert_eq!(last["app_customers"]["1"]["name"], "Acme");
    }

    #[tokio::test]
    async fn tampering_breaks_the_chain() {
        let app = TestApp::new().await;
        let apps = seed(&app).await;
        let db = &app.state.db;
        make_version(&app.state, &apps, "customers", 1, 1).await.unwrap();
        make_version(&app.state, &apps, "customers", 1, 1).await.unwrap();
        let missing = get_version(db, &apps, "customers", 1, Some(7)).await.unwrap_err();
        assert!(missing.to_string().contains("not found"));

        db.query("UPDATE app_customers_version SET user_id = 9 WHERE ver_id = 2", &[])
            .await
            .unwrap();

        assert!(get_version(db, &apps, "customers", 1, Some(1)).await.is_ok());
        let err = get_version(db, &apps, "customers", 1, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Blockchain integrity break for customers:1:2");
    }
}
