//! CRUD actions over registered apps, with the index, control and version
//! bookkeeping that follows every write.

use crate::{
    datetime::current_datetime,
    db::{Record, intval, record, result::scalar_to_string},
    sql::{get_fields, make_fulltext_query, prepare_insert_query, prepare_update_query},
    text::encode_bad_chars,
};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    AppState, ServiceError, ServiceResult,
    app_log::make_log_bypass,
    apps::{Apps, Subtable},
    auth_service::Caller,
    perms::Access,
    version::make_version,
};

/// Rows per listing page.
pub const LIST_LIMIT: i64 = 15;

/// Row actions offered by listings, with the perm each one needs.
const ROW_ACTIONS: [(&str, &str); 3] = [("view", "view"), ("edit", "edit"), ("delete", "delete")];

#[track_caller]
fn denied() -> ServiceError {
    ServiceError::rejected("Permission denied")
}

/// Rebuild the search text of `reg_id` from the string values of the row
/// and its subtables. The index row is dropped when the app row is gone.
pub async fn make_index(state: &AppState, apps: &Apps, app: &str, reg_id: i64) -> ServiceResult<()> {
    if !apps.app2index(app)? {
        return Ok(());
    }
    let db = &state.db;
    let table = apps.app2table(app)?;
    let index = format!("{}_index", table);
    let Some(row) = db
        .fetch_one::<Record>(&format!("SELECT * FROM {} WHERE id = ?", table), &[json!(reg_id)])
        .await?
    else {
        db.query(&format!("DELETE FROM {} WHERE id = ?", index), &[json!(reg_id)])
            .await?;
        return Ok(());
    };

    let mut words = Vec::new();
    collect_words(&row, &["id"], &mut words);
    for subtable in apps.app2subtables(app)? {
        let rows = db
            .query(
                &format!("SELECT * FROM {} WHERE {} = ? ORDER BY id", subtable.subtable, subtable.field),
                &[json!(reg_id)],
            )
            .await?
            .into_records();
        for row in &rows {
            collect_words(row, &["id", subtable.field.as_str()], &mut words);
        }
    }
    let search = encode_bad_chars(&words.join(" "), ' ', "");

    let exists = db
        .execute_scalar(&format!("SELECT id FROM {} WHERE id = ?", index), &[json!(reg_id)])
        .await?;
    if exists != 0 {
        db.query(
            &format!("UPDATE {} SET search = ? WHERE id = ?", index),
            &[json!(search), json!(reg_id)],
        )
        .await?;
    } else {
        db.query(
            &format!("INSERT INTO {}(id, search) VALUES(?, ?)", index),
            &[json!(reg_id), json!(search)],
        )
        .await?;
    }
    Ok(())
}

fn collect_words(row: &Record, skip: &[&str], words: &mut Vec<String>) {
    words.extend(
        row.iter()
            .filter(|(column, _)| !skip.contains(&column.as_str()))
            .map(|(_, value)| scalar_to_string(value))
            .filter(|text| !text.is_empty()),
    );
}

/// Record the owner of `reg_id` the first time it is seen and forget it once
/// the row is gone.
pub async fn make_control(state: &AppState, apps: &Apps, app: &str, reg_id: i64, user_id: i64) -> ServiceResult<()> {
    if !apps.app2control(app)? {
        return Ok(());
    }
    let db = &state.db;
    let table = apps.app2table(app)?;
    let control = format!("{}_control", table);
    let control_id = db
        .execute_scalar(&format!("SELECT id FROM {} WHERE id = ?", control), &[json!(reg_id)])
        .await?;
    let data_id = db
        .execute_scalar(&format!("SELECT id FROM {} WHERE id = ?", table), &[json!(reg_id)])
        .await?;
    match (data_id, control_id) {
        (0, 0) => {}
        (0, _) => {
            db.query(&format!("DELETE FROM {} WHERE id = ?", control), &[json!(reg_id)])
                .await?;
        }
        (_, 0) => {
            let group_id = db
                .execute_scalar("SELECT group_id FROM tbl_users WHERE id = ?", &[json!(user_id)])
                .await?;
            let (query, params) = prepare_insert_query(
                db,
                &control,
                &record(json!({
                    "id": reg_id,
                    "user_id": user_id,
                    "group_id": group_id,
                    "users_id": "",
                    "groups_id": "",
                    "datetime": current_datetime(0),
                })),
            )
            .await?;
            db.query(&query, &params).await?;
        }
        _ => {}
    }
    Ok(())
}

/// CRUD entry point for one caller.
pub struct Records<'a> {
    caller: &'a Caller,
    access: Access,
}

impl<'a> Records<'a> {
    pub async fn load(caller: &'a Caller) -> ServiceResult<Self> {
        let access = Access::load(caller).await?;
        Ok(Self { caller, access })
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    fn state(&self) -> &AppState {
        self.caller.state()
    }

    fn apps(&self) -> &Apps {
        self.access.apps()
    }

    /// Metadata of `app` and the perms the caller holds on it.
    pub async fn app(&self, app: &str) -> ServiceResult<Value> {
        if !self.apps().app_exists(app) {
            return Err(ServiceError::rejected(format!("app {} not found", app)));
        }
        let perms = self.access.granted_perms(app)?;
        if perms.is_empty() {
            return Err(denied());
        }
        let apps = self.apps();
        let row = apps.row(app)?;
        Ok(json!({
            "app": row.code,
            "name": row.name,
            "table": apps.app2table(app)?,
            "subtables": apps.app2subtables(app)?,
            "has_index": apps.app2index(app)?,
            "has_control": apps.app2control(app)?,
            "has_version": apps.app2version(app)?,
            "has_files": apps.app2files(app)?,
            "has_notes": apps.app2notes(app)?,
            "has_log": apps.app2log(app)?,
            "perms": perms,
        }))
    }

    /// One page of rows visible to the caller, newest first.
    pub async fn list(&self, app: &str, search: &str, page: i64) -> ServiceResult<Value> {
        if !self.apps().app_exists(app) {
            return Err(ServiceError::rejected(format!("app {} not found", app)));
        }
        if !self.access.check_app_perm_id(app, "list", None).await? {
            return Err(denied());
        }
        let apps = self.apps();
        let table = apps.app2table(app)?;
        let filter = self.access.check_sql(app, "list")?;
        let search_filter = if apps.app2index(app)? {
            make_fulltext_query(search, table, "", 1, "1=1")
        } else {
            "1=1".to_string()
        };
        let page = page.max(0);
        let offset = page.saturating_mul(LIST_LIMIT);
        let rows = self
            .state()
            .db
            .query(
                &format!(
                    "SELECT * FROM {} WHERE {} AND {} ORDER BY id DESC LIMIT {} OFFSET {}",
                    table, filter, search_filter, LIST_LIMIT, offset
                ),
                &[],
            )
            .await?
            .into_records();

        let mut data = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = intval(row.get("id").unwrap_or(&Value::Null));
            let mut actions = Vec::new();
            for (action, perm) in ROW_ACTIONS {
                let url = if self.access.check_app_perm_id(app, perm, Some(id)).await? {
                    format!("#app/{}/{}/{}", app, action, id)
                } else {
                    String::new()
                };
                actions.push(json!({ "app": app, "action": action, "url": url }));
            }
            row.insert("actions".into(), Value::Array(actions));
            data.push(Value::Object(row));
        }

        let user_id = self.caller.current_user().await?;
        let data = Value::Array(data);
        self.trail(app, "list", &data, user_id).await?;
        let mut out = record(json!({ "data": data }));
        if !search.is_empty() {
            out.insert("search".into(), json!(search));
        }
        if page != 0 {
            out.insert("page".into(), json!(page));
        }
        Ok(Value::Object(out))
    }

    /// The row with its subtable rows under their aliases.
    pub async fn view(&self, app: &str, id: i64) -> ServiceResult<Value> {
        if !self.apps().app_exists(app) || !self.access.check_app_perm_id(app, "view", Some(id)).await? {
            return Err(denied());
        }
        let db = &self.state().db;
        let apps = self.apps();
        let table = apps.app2table(app)?;
        let Some(mut row) = db
            .fetch_one::<Record>(&format!("SELECT * FROM {} WHERE id = ?", table), &[json!(id)])
            .await?
        else {
            return Err(denied());
        };
        for subtable in apps.app2subtables(app)?.iter().filter(|s| !s.alias.is_empty()) {
            let rows = db
                .query(
                    &format!("SELECT * FROM {} WHERE {} = ? ORDER BY id", subtable.subtable, subtable.field),
                    &[json!(id)],
                )
                .await?
                .fetch_all();
            row.insert(subtable.alias.clone(), Value::Array(rows));
        }
        let row = Value::Object(row);
        let user_id = self.caller.current_user().await?;
        self.trail(app, "view", &row, user_id).await?;
        Ok(json!({ "data": row }))
    }

    /// Split `data` into main row columns and subtable rows. Keys that are
    /// neither are refused.
    async fn split_data(&self, app: &str, data: &Value) -> ServiceResult<(Record, Vec<(Subtable, Vec<Record>)>)> {
        let Some(data) = data.as_object() else {
            return Err(denied());
        };
        let apps = self.apps();
        let table = apps.app2table(app)?;
        let fields = get_fields(&self.state().db, table).await?;
        let subtables = apps.app2subtables(app)?;

        let mut main = Record::new();
        let mut subdata = Vec::new();
        for (key, value) in data {
            if fields.iter().any(|field| &field.name == key) {
                main.insert(key.clone(), value.clone());
                continue;
            }
            let Some(subtable) = subtables.iter().find(|s| !s.alias.is_empty() && &s.alias == key) else {
                return Err(denied());
            };
            let Some(rows) = value.as_array() else {
                return Err(denied());
            };
            let rows = rows
                .iter()
                .map(|row| row.as_object().cloned().ok_or_else(denied))
                .collect::<ServiceResult<Vec<_>>>()?;
            subdata.push((subtable.clone(), rows));
        }
        Ok((main, subdata))
    }

    async fn bookkeeping(&self, app: &str, id: i64, user_id: i64) -> ServiceResult<()> {
        let state = self.state();
        let apps = self.apps();
        make_index(state, apps, app, id).await?;
        make_control(state, apps, app, id, user_id).await?;
        make_version(state, apps, app, id, user_id).await?;
        Ok(())
    }

    /// Audit trail entry for the rows in `data`, when the app keeps one.
    async fn trail(&self, app: &str, log: &str, data: &Value, user_id: i64) -> ServiceResult<()> {
        make_log_bypass(&self.state().db, self.apps(), app, user_id, log, data).await?;
        Ok(())
    }

    /// Insert a row and its subtable rows; returns the new id.
    pub async fn insert(&self, app: &str, data: &Value) -> ServiceResult<Value> {
        let user_id = self.caller.current_user().await?;
        if user_id == 0 {
            return Err(ServiceError::Logout("Permission denied".into()));
        }
        if !self.apps().app_exists(app) {
            return Err(denied());
        }
        if !self.access.check_app_perm_id(app, "create", None).await? {
            return Err(denied());
        }
        let (main, subdata) = self.split_data(app, data).await?;
        let db = &self.state().db;
        let table = self.apps().app2table(app)?;

        let (query, params) = prepare_insert_query(db, table, &main).await?;
        db.query(&query, &params).await?;
        let id = db.execute_scalar(&format!("SELECT MAX(id) FROM {}", table), &[]).await?;

        for (subtable, rows) in subdata {
            for mut row in rows {
                row.insert(subtable.field.clone(), json!(id));
                let (query, params) = prepare_insert_query(db, &subtable.subtable, &row).await?;
                db.query(&query, &params).await?;
            }
        }
        self.bookkeeping(app, id, user_id).await?;
        self.trail(app, "insert", &json!({ "id": id }), user_id).await?;
        info!("user {} inserted {}:{}", user_id, app, id);
        Ok(json!({ "status": "ok", "id": id }))
    }

    /// Update a row. Subtable rows without `id` are inserted, a positive
    /// `id` updates and a negative one deletes that row.
    pub async fn update(&self, app: &str, id: i64, data: &Value) -> ServiceResult<Value> {
        let user_id = self.caller.current_user().await?;
        if user_id == 0 {
            return Err(ServiceError::Logout("Permission denied".into()));
        }
        if !self.apps().app_exists(app) {
            return Err(denied());
        }
        if !self.access.check_app_perm_id(app, "edit", Some(id)).await? {
            return Err(denied());
        }
        let (main, subdata) = self.split_data(app, data).await?;
        let db = &self.state().db;
        let table = self.apps().app2table(app)?;

        if !main.is_empty() {
            let (query, params) =
                prepare_update_query(db, table, &main, &record(json!({ "id": id }))).await?;
            db.query(&query, &params).await?;
        }
        for (subtable, rows) in subdata {
            for mut row in rows {
                let Some(sub_id) = row.remove("id") else {
                    row.insert(subtable.field.clone(), json!(id));
                    let (query, params) = prepare_insert_query(db, &subtable.subtable, &row).await?;
                    db.query(&query, &params).await?;
                    continue;
                };
                let sub_id = intval(&sub_id);
                if sub_id > 0 {
                    if row.is_empty() {
                        continue;
                    }
                    let mut filter = Record::new();
                    filter.insert("id".into(), json!(sub_id));
                    filter.insert(subtable.field.clone(), json!(id));
                    let (query, params) = prepare_update_query(db, &subtable.subtable, &row, &filter).await?;
                    db.query(&query, &params).await?;
                } else if sub_id < 0 {
                    db.query(
                        &format!("DELETE FROM {} WHERE id = ? AND {} = ?", subtable.subtable, subtable.field),
                        &[json!(-sub_id), json!(id)],
                    )
                    .await?;
                } else {
                    return Err(ServiceError::internal("subdata found with id=0"));
                }
            }
        }
        self.bookkeeping(app, id, user_id).await?;
        self.trail(app, "update", &json!({ "id": id }), user_id).await?;
        debug!("user {} updated {}:{}", user_id, app, id);
        Ok(json!({ "status": "ok" }))
    }

    /// Delete a row and its subtable rows.
    pub async fn delete(&self, app: &str, id: i64) -> ServiceResult<Value> {
        let user_id = self.caller.current_user().await?;
        if user_id == 0 {
            return Err(ServiceError::Logout("Permission denied".into()));
        }
        if !self.apps().app_exists(app) {
            return Err(denied());
        }
        if !self.access.check_app_perm_id(app, "delete", Some(id)).await? {
            return Err(denied());
        }
        let db = &self.state().db;
        let apps = self.apps();
        let table = apps.app2table(app)?;
        for subtable in apps.app2subtables(app)? {
            db.query(
                &format!("DELETE FROM {} WHERE {} = ?", subtable.subtable, subtable.field),
                &[json!(id)],
            )
            .await?;
        }
        db.query(&format!("DELETE FROM {} WHERE id = ?", table), &[json!(id)])
            .await?;
        self.bookkeeping(app, id, user_id).await?;
        self.trail(app, "delete", &json!({ "id": id }), user_id).await?;
        info!("user {} deleted {}:{}", user_id, app, id);
        Ok(json!({ "status": "ok" }))
    }
}
