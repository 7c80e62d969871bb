//! Token authentication: login, logout, token refresh and password change.

use crate::{
    datetime::{add_seconds, current_datetime, current_dow, current_time},
    db::{Database, intval, record},
    errors::code_from_location,
    models::user::{Password, Token, User},
    sql::{prepare_insert_query, prepare_update_query},
    tokens::get_unique_token,
};
use serde_json::{Value, json};
use std::panic::Location;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{
    AppState, ServiceError, ServiceResult,
    password::{hash_password, is_legacy_md5, password_strength, verify_password},
};

/// How the transport identifies the caller.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub token: String,
    pub remote_addr: String,
    pub user_agent: String,
}

#[track_caller]
fn ko(text: &str) -> Value {
    json!({
        "status": "ko",
        "text": text,
        "code": code_from_location(Location::caller()),
    })
}

/// Deactivate expired tokens and passwords, tokens of users without an
/// active password, and tokens of users outside their time window or day
/// mask.
pub async fn crontab_users(db: &Database) -> ServiceResult<()> {
    let datetime = Value::String(current_datetime(0));
    let time = Value::String(current_time());
    let dow = Value::from(current_dow());
    db.query(
        "UPDATE tbl_users_tokens SET active = 0 WHERE active = 1 AND expires_at <= ?",
        &[datetime.clone()],
    )
    .await?;
    db.query(
        "UPDATE tbl_users_passwords SET active = 0 WHERE active = 1 AND expires_at <= ?",
        &[datetime],
    )
    .await?;
    db.query(
        "UPDATE tbl_users_tokens SET active = 0 WHERE active = 1 AND user_id NOT IN (
            SELECT user_id FROM tbl_users_passwords WHERE active = 1)",
        &[],
    )
    .await?;
    db.query(
        "UPDATE tbl_users_tokens SET active = 0 WHERE active = 1 AND user_id IN (
            SELECT id FROM tbl_users WHERE (
                start = end OR
                (start < end AND (? < start OR ? > end)) OR
                (start > end AND ? < start AND ? > end) OR
                SUBSTR(days, ?, 1) = '0'))",
        &[time.clone(), time.clone(), time.clone(), time, dow],
    )
    .await?;
    Ok(())
}

/// The caller of one request. Lookups run once and are kept for the rest of
/// the request.
pub struct Caller {
    state: AppState,
    session: Session,
    crontab: OnceCell<()>,
    token_id: OnceCell<i64>,
    user_id: OnceCell<i64>,
    group_id: OnceCell<i64>,
    groups: OnceCell<String>,
}

impl Caller {
    pub fn new(state: AppState, session: Session) -> Self {
        Self {
            state,
            session,
            crontab: OnceCell::new(),
            token_id: OnceCell::new(),
            user_id: OnceCell::new(),
            group_id: OnceCell::new(),
            groups: OnceCell::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    fn db(&self) -> &Database {
        &self.state.db
    }

    /// [`crontab_users`], at most once per request.
    pub async fn crontab_users(&self) -> ServiceResult<()> {
        self.crontab
            .get_or_try_init(|| crontab_users(self.db()))
            .await
            .map(|_| ())
    }

    /// Id of the active token matching the session, 0 when there is none.
    pub async fn current_token(&self) -> ServiceResult<i64> {
        self.token_id
            .get_or_try_init(|| async {
                self.crontab_users().await?;
                if self.session.token.is_empty() {
                    return Ok(0);
                }
                let id = self
                    .db()
                    .execute_scalar(
                        "SELECT id FROM tbl_users_tokens
                        WHERE token = ? AND active = 1 AND remote_addr = ? AND user_agent = ?",
                        &[
                            json!(self.session.token),
                            json!(self.session.remote_addr),
                            json!(self.session.user_agent),
                        ],
                    )
                    .await?;
                Ok::<_, ServiceError>(id)
            })
            .await
            .copied()
    }

    pub async fn current_user(&self) -> ServiceResult<i64> {
        self.user_id
            .get_or_try_init(|| async {
                let token_id = self.current_token().await?;
                if token_id == 0 {
                    return Ok(0);
                }
                let id = self
                    .db()
                    .execute_scalar(
                        "SELECT user_id FROM tbl_users_tokens WHERE id = ? AND active = 1",
                        &[json!(token_id)],
                    )
                    .await?;
                Ok::<_, ServiceError>(id)
            })
            .await
            .copied()
    }

    pub async fn current_group(&self) -> ServiceResult<i64> {
        self.group_id
            .get_or_try_init(|| async {
                let user_id = self.current_user().await?;
                let id = self
                    .db()
                    .execute_scalar(
                        "SELECT group_id FROM tbl_users WHERE id = ? AND active = 1",
                        &[json!(user_id)],
                    )
                    .await?;
                Ok::<_, ServiceError>(id)
            })
            .await
            .copied()
    }

    /// Every group of the user as a comma separated list: the primary group,
    /// the `groups_id` list and the groups naming the user in `users_id`.
    /// `"0"` for anonymous callers.
    pub async fn current_groups(&self) -> ServiceResult<String> {
        self.groups
            .get_or_try_init(|| async {
                let user_id = self.current_user().await?;
                if user_id == 0 {
                    return Ok("0".to_string());
                }
                let mut ids = Vec::new();
                if let Some(user) = self
                    .db()
                    .fetch_one::<User>(
                        "SELECT * FROM tbl_users WHERE active = 1 AND id = ?",
                        &[json!(user_id)],
                    )
                    .await?
                {
                    ids.push(user.group_id.to_string());
                    ids.extend(user.groups_id.filter(|list| !list.is_empty()));
                }
                let groups = self
                    .db()
                    .query("SELECT id, users_id FROM tbl_groups WHERE active = 1", &[])
                    .await?
                    .into_records();
                let needle = user_id.to_string();
                for group in groups {
                    let listed = group
                        .get("users_id")
                        .and_then(Value::as_str)
                        .map(|list| list.split(',').any(|id| id.trim() == needle))
                        .unwrap_or(false);
                    if listed {
                        ids.push(intval(group.get("id").unwrap_or(&Value::Null)).to_string());
                    }
                }
                Ok::<_, ServiceError>(ids.join(","))
            })
            .await
            .cloned()
    }

    /// Log `user` in. On success every previous token of the user is
    /// deactivated and a fresh one is returned.
    pub async fn authtoken(&self, user: &str, pass: &str) -> ServiceResult<Value> {
        let db = self.db();
        let Some(row) = db
            .fetch_one::<User>("SELECT * FROM tbl_users WHERE active = 1 AND login = ?", &[json!(user)])
            .await?
            .filter(|row| row.login == user)
        else {
            return Ok(ko("Permission denied"));
        };

        let Some(password) = db
            .fetch_one::<Password>(
                "SELECT * FROM tbl_users_passwords WHERE user_id = ? AND active = 1",
                &[json!(row.id)],
            )
            .await?
        else {
            return Ok(ko("Permission denied"));
        };

        if verify_password(pass, &password.password) {
            debug!("password verified for user {}", row.id);
        } else if is_legacy_md5(pass, &password.password) {
            info!("upgrading legacy password hash of user {}", row.id);
            let (query, params) = prepare_update_query(
                db,
                "tbl_users_passwords",
                &record(json!({ "password": hash_password(pass)? })),
                &record(json!({ "id": password.id })),
            )
            .await?;
            db.query(&query, &params).await?;
        } else {
            return Ok(ko("Permission denied"));
        }

        let (query, params) = prepare_update_query(
            db,
            "tbl_users_tokens",
            &record(json!({ "active": 0 })),
            &record(json!({ "user_id": row.id, "active": 1 })),
        )
        .await?;
        db.query(&query, &params).await?;

        let config = &self.state.config;
        let created_at = current_datetime(0);
        let token = get_unique_token();
        let expires_at = current_datetime(config.token_short_expires)
            .min(current_datetime(config.token_long_expires));
        let (query, params) = prepare_insert_query(
            db,
            "tbl_users_tokens",
            &record(json!({
                "user_id": row.id,
                "active": 1,
                "created_at": created_at,
                "remote_addr": self.session.remote_addr,
                "user_agent": self.session.user_agent,
                "token": token,
                "expires_at": expires_at,
            })),
        )
        .await?;
        db.query(&query, &params).await?;
        info!("user {} logged in", row.id);

        Ok(json!({
            "status": "ok",
            "token": token,
            "created_at": created_at,
            "expires_at": expires_at,
        }))
    }

    /// Deactivate the caller's token.
    pub async fn deauthtoken(&self) -> ServiceResult<Value> {
        let token_id = self.current_token().await?;
        if token_id == 0 {
            return Ok(ko("Permission denied"));
        }
        let db = self.db();
        let (query, params) = prepare_update_query(
            db,
            "tbl_users_tokens",
            &record(json!({ "active": 0 })),
            &record(json!({ "id": token_id })),
        )
        .await?;
        db.query(&query, &params).await?;
        Ok(json!({ "status": "ok" }))
    }

    /// Refresh the caller's token. The new expiry never passes the long
    /// expiry counted from the token creation.
    pub async fn checktoken(&self) -> ServiceResult<Value> {
        let token_id = self.current_token().await?;
        if token_id == 0 {
            return Ok(ko("Permission denied"));
        }
        let db = self.db();
        let Some(row) = db
            .fetch_one::<Token>("SELECT * FROM tbl_users_tokens WHERE id = ?", &[json!(token_id)])
            .await?
        else {
            return Ok(ko("Permission denied"));
        };

        let config = &self.state.config;
        let updated_at = current_datetime(0);
        let short_expires = current_datetime(config.token_short_expires);
        let long_expires = add_seconds(&row.created_at, config.token_long_expires)
            .ok_or_else(|| ServiceError::internal(format!("Invalid created_at '{}'", row.created_at)))?;
        let expires_at = short_expires.min(long_expires);

        let (query, params) = prepare_update_query(
            db,
            "tbl_users_tokens",
            &record(json!({ "updated_at": updated_at, "expires_at": expires_at })),
            &record(json!({ "id": token_id })),
        )
        .await?;
        db.query(&query, &params).await?;

        Ok(json!({
            "status": "ok",
            "token": row.token,
            "created_at": row.created_at,
            "updated_at": updated_at,
            "expires_at": expires_at,
        }))
    }

    /// Replace the caller's password.
    pub async fn authupdate(&self, oldpass: &str, newpass: &str, renewpass: &str) -> ServiceResult<Value> {
        let user_id = self.current_user().await?;
        if user_id == 0 {
            return Ok(ko("Authentication update error"));
        }
        if newpass != renewpass {
            return Ok(ko("New password differs"));
        }
        if !self.oldpass_check(user_id, oldpass).await? {
            return Ok(ko("Old password authentication error"));
        }
        if password_strength(newpass) < self.state.config.password_min_score {
            return Ok(ko("New password strength error"));
        }
        if !self.newpass_check(user_id, newpass).await? {
            return Ok(ko("New password used previously"));
        }

        let db = self.db();
        let (query, params) = prepare_update_query(
            db,
            "tbl_users_passwords",
            &record(json!({ "active": 0 })),
            &record(json!({ "user_id": user_id, "active": 1 })),
        )
        .await?;
        db.query(&query, &params).await?;

        let created_at = current_datetime(0);
        let expires_at = current_datetime(self.state.config.password_expires);
        let (query, params) = prepare_insert_query(
            db,
            "tbl_users_passwords",
            &record(json!({
                "active": 1,
                "user_id": user_id,
                "created_at": created_at,
                "remote_addr": self.session.remote_addr,
                "user_agent": self.session.user_agent,
                "password": hash_password(newpass)?,
                "expires_at": expires_at,
            })),
        )
        .await?;
        db.query(&query, &params).await?;
        info!("user {} changed password", user_id);

        Ok(json!({
            "status": "ok",
            "updated_at": created_at,
            "expires_at": expires_at,
        }))
    }

    async fn oldpass_check(&self, user_id: i64, oldpass: &str) -> ServiceResult<bool> {
        let row = self
            .db()
            .fetch_one::<Password>(
                "SELECT * FROM tbl_users_passwords WHERE user_id = ? AND active = 1",
                &[json!(user_id)],
            )
            .await?;
        Ok(row.is_some_and(|row| verify_password(oldpass, &row.password)))
    }

    /// False when `newpass` matches any password the user ever had.
    async fn newpass_check(&self, user_id: i64, newpass: &str) -> ServiceResult<bool> {
        let history = self
            .db()
            .fetch_all_as::<Password>(
                "SELECT * FROM tbl_users_passwords WHERE user_id = ?",
                &[json!(user_id)],
            )
            .await?;
        Ok(!history.iter().any(|row| {
            verify_password(newpass, &row.password) || is_legacy_md5(newpass, &row.password)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestApp, session};

    #[tokio::test]
    async fn login_check_logout_lifecycle() {
        let app = TestApp::new().await;
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;

        let caller = Caller::new(app.state.clone(), session(""));
        let login = caller.authtoken("alice", "Al1ce!Secret").await.unwrap();
        assert_eq!(login["status"], "ok");
        let token = login["token"].as_str().unwrap().to_string();

        let caller = Caller::new(app.state.clone(), session(&token));
        assert!(caller.current_token().await.unwrap() > 0);
        assert_eq!(caller.current_user().await.unwrap(), 2);
        assert_eq!(caller.current_group().await.unwrap(), 1);

        let check = caller.checktoken().await.unwrap();
        assert_eq!(check["status"], "ok");
        assert_eq!(check["token"], token.as_str());
        assert!(check["expires_at"].as_str().unwrap() > check["updated_at"].as_str().unwrap());

        assert_eq!(caller.deauthtoken().await.unwrap()["status"], "ok");
        let after = Caller::new(app.state.clone(), session(&token));
        assert_eq!(after.current_token().await.unwrap(), 0);
        assert_eq!(after.checktoken().await.unwrap()["text"], "Permission denied");
    }

    #[tokio::test]
    async fn wrong_credentials_are_denied() {
        let app = TestApp::new().await;
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;
        let caller = Caller::new(app.state.clone(), session(""));

        let bad_pass = caller.authtoken("alice", "nope").await.unwrap();
        assert_eq!(bad_pass["status"], "ko");
        assert_eq!(bad_pass["text"], "Permission denied");
        assert!(bad_pass["code"].as_str().unwrap().starts_with("auth_service:"));

        let bad_user = caller.authtoken("mallory", "x").await.unwrap();
        assert_eq!(bad_user["status"], "ko");
    }

    #[tokio::test]
    async fn legacy_md5_password_is_upgraded() {
        let app = TestApp::new().await;
        app.add_user(3, "bob", "", 1).await;
        app.state
            .db
            .query(
                "UPDATE tbl_users_passwords SET password = ? WHERE user_id = 3",
                &[json!(format!("{:x}", md5::compute("bobpass")))],
            )
            .await
            .unwrap();

        let caller = Caller::new(app.state.clone(), session(""));
        assert_eq!(caller.authtoken("bob", "bobpass").await.unwrap()["status"], "ok");
        let stored = app
            .state
            .db
            .execute_query("SELECT password FROM tbl_users_passwords WHERE user_id = 3", &[])
            .await
            .unwrap();
        assert!(stored.as_str().unwrap().starts_with("$argon2"));
    }

    #[tokio::test]
    async fn second_login_revokes_the_first_token() {
        let app = TestApp::new().await;
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;
        let first = Caller::new(app.state.clone(), session(""))
            .authtoken("alice", "Al1ce!Secret")
            .await
            .unwrap();
        Caller::new(app.state.clone(), session(""))
            .authtoken("alice", "Al1ce!Secret")
            .await
            .unwrap();
        let old = Caller::new(app.state.clone(), session(first["token"].as_str().unwrap()));
        assert_eq!(old.current_token().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_time_window_revokes_tokens() {
        let app = TestApp::new().await;
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;
        let login = Caller::new(app.state.clone(), session(""))
            .authtoken("alice", "Al1ce!Secret")
            .await
            .unwrap();
        app.state
            .db
            .query("UPDATE tbl_users SET start = '00:00:00', \"end\" = '00:00:00' WHERE id = 2", &[])
            .await
            .unwrap();
        let caller = Caller::new(app.state.clone(), session(login["token"].as_str().unwrap()));
        assert_eq!(caller.current_token().await.unwrap(), 0);
        assert_eq!(caller.current_groups().await.unwrap(), "0");
    }

    #[tokio::test]
    async fn password_update_rules() {
        let app = TestApp::new().await;
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;
        let login = Caller::new(app.state.clone(), session(""))
            .authtoken("alice", "Al1ce!Secret")
            .await
            .unwrap();
        let token = login["token"].as_str().unwrap().to_string();

        let anonymous = Caller::new(app.state.clone(), session(""));
        assert_eq!(
            anonymous.authupdate("a", "b", "b").await.unwrap()["text"],
            "Authentication update error"
        );

        let caller = Caller::new(app.state.clone(), session(&token));
        let cases = [
            ("Al1ce!Secret", "N3w!Passw0rd#x", "other", "New password differs"),
            ("wrong", "N3w!Passw0rd#x", "N3w!Passw0rd#x", "Old password authentication error"),
            ("Al1ce!Secret", "abc", "abc", "New password strength error"),
            ("Al1ce!Secret", "Al1ce!Secret", "Al1ce!Secret", "New password used previously"),
        ];
        for (old, new, renew, text) in cases {
            let result = caller.authupdate(old, new, renew).await.unwrap();
            assert_eq!(result["status"], "ko");
            assert_eq!(result["text"], text);
        }

        let ok = caller
            .authupdate("Al1ce!Secret", "N3w!Passw0rd#x", "N3w!Passw0rd#x")
            .await
            .unwrap();
        assert_eq!(ok["status"], "ok");

        let relogin = Caller::new(app.state.clone(), session(""))
            .authtoken("alice", "N3w!Passw0rd#x")
            .await
            .unwrap();
        assert_eq!(relogin["status"], "ok");
    }

    #[tokio::test]
    async fn groups_merge_all_sources() {
        let app = TestApp::new().await;
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;
        app.state
            .db
            .query("UPDATE tbl_users SET groups_id = '4,5' WHERE id = 2", &[])
            .await
            .unwrap();
        app.state
            .db
            .query(
                "INSERT INTO tbl_groups (id, active, code, name, users_id) VALUES (7, 1, 'g7', 'G7', '3,2')",
                &[],
            )
            .await
            .unwrap();
        let login = Caller::new(app.state.clone(), session(""))
            .authtoken("alice", "Al1ce!Secret")
            .await
            .unwrap();
        let caller = Caller::new(app.state.clone(), session(login["token"].as_str().unwrap()));
        assert_eq!(caller.current_groups().await.unwrap(), "1,4,5,7");
    }
}
