//! The `api/?<action>/...` surface.
//!
//! A request is reduced to an [`ApiRequest`] (method, content type, rest
//! segments, JSON object and session), validated, and dispatched on
//! `rest[0]`. HTTP and the command line share [`handle`].

use crate::{
    db::{intval, result::scalar_to_string, semaphore::SemaphoreGuard},
    errors::{AppError, ErrorKind, ErrorReport, Section},
    models::upload::FileEntry,
    services::{
        AppState, ServiceError,
        auth_service::{Caller, Session},
        gc::gc_exec,
        log_service::DEFAULT_LOG,
        records::Records,
        score::{DEFAULT_HEIGHT, DEFAULT_WIDTH, score_report},
        upload_service::UploadService,
    },
    text::encode_bad_chars,
    tokens::check_token_format,
};
use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::{net::SocketAddr, time::Instant};
use tracing::{debug, error, warn};

/// Largest request body accepted.
const MAX_BODY: usize = 64 * 1024 * 1024;

/// Fields every upload descriptor must carry.
const FILE_FIELDS: [&str; 9] = ["id", "app", "name", "size", "type", "data", "error", "file", "hash"];

/// One request as seen by the actions.
#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    /// Upper-cased HTTP method, or `CLI`.
    pub method: String,
    /// Lower-cased media type without parameters.
    pub content_type: String,
    pub rest: Vec<String>,
    pub json: Map<String, Value>,
    pub session: Session,
}

/// Split the raw query string on `/`, dropping empty segments.
pub fn parse_rest(query: &str) -> Vec<String> {
    query
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// The body as a JSON object; anything else counts as no data.
pub fn parse_json(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl ApiRequest {
    pub async fn from_http(request: Request) -> Result<Self, AppError> {
        let (parts, body) = request.into_parts();
        let header_text = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let content_type = header_text(header::CONTENT_TYPE)
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let token = parts
            .headers
            .get("token")
            .and_then(|value| value.to_str().ok())
            .map(check_token_format)
            .unwrap_or_default();
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();
        let session = Session {
            token,
            remote_addr,
            user_agent: header_text(header::USER_AGENT),
        };

        let bytes = axum::body::to_bytes(body, MAX_BODY)
            .await
            .map_err(|_| AppError::json("Unknown request"))?;
        Ok(Self {
            method: parts.method.as_str().to_uppercase(),
            content_type,
            rest: parse_rest(parts.uri.query().unwrap_or_default()),
            json: parse_json(&bytes),
            session,
        })
    }

    /// A command line request: `rest` from the arguments, JSON from stdin.
    pub fn from_cli(rest: &[String], stdin: &str, token: &str, user: &str) -> Self {
        Self {
            method: "CLI".into(),
            content_type: String::new(),
            rest: parse_rest(&rest.join("/")),
            json: parse_json(stdin.as_bytes()),
            session: Session {
                token: check_token_format(token),
                remote_addr: user.to_string(),
                user_agent: format!("saltos/{}", env!("CARGO_PKG_VERSION")),
            },
        }
    }

    pub fn rest(&self, index: usize) -> &str {
        self.rest.get(index).map(String::as_str).unwrap_or_default()
    }

    /// `rest[index]` reduced to a safe identifier.
    fn rest_code(&self, index: usize) -> String {
        encode_bad_chars(self.rest(index), '_', "")
    }

    /// A JSON field as text; `None` when absent or null.
    pub fn json_text(&self, key: &str) -> Option<String> {
        self.json
            .get(key)
            .filter(|value| !value.is_null())
            .map(scalar_to_string)
    }

    /// Method, content type and payload must agree, and there must be an
    /// action to run.
    #[track_caller]
    pub fn validate(&self) -> Result<(), AppError> {
        let valid = !self.rest(0).is_empty()
            && match self.method.as_str() {
                "GET" => self.content_type.is_empty() && self.json.is_empty(),
                "POST" => self.content_type == "application/json" && !self.json.is_empty(),
                "CLI" => true,
                _ => false,
            };
        if valid {
            Ok(())
        } else {
            Err(AppError::json("Unknown request"))
        }
    }
}

/// `GET|POST /api/?<rest>` and `/?<rest>`.
pub async fn api(State(state): State<AppState>, request: Request) -> Response {
    match ApiRequest::from_http(request).await {
        Ok(req) => handle(&state, &req).await.map(Json).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Run one request. Reports are logged before they are returned.
pub async fn handle(state: &AppState, req: &ApiRequest) -> Result<Value, AppError> {
    match dispatch(state, req).await {
        Ok(value) => Ok(value),
        Err(err) => Err(file_error(state, req, err).await),
    }
}

async fn file_error(state: &AppState, req: &ApiRequest, err: AppError) -> AppError {
    let AppError { status, kind } = err;
    let report = match kind {
        ErrorKind::Report(report) => report,
        other => return AppError { status, kind: other },
    };
    let report = report
        .scrub(&state.config.private_values())
        .with_pairs(
            Section::Debug,
            [
                ("rest", req.rest.join("/")),
                ("token", req.session.token.clone()),
            ],
        );
    error!(code = report.code(), "{}", report.message());
    if let Err(err) = state.log.file_report(report.clone()).await {
        warn!("could not write error report: {}", err);
    }
    AppError {
        status,
        kind: ErrorKind::Report(report),
    }
}

async fn dispatch(state: &AppState, req: &ApiRequest) -> Result<Value, AppError> {
    req.validate()?;
    let action = req.rest_code(0);
    debug!("{} {}", req.method, action);
    let caller = Caller::new(state.clone(), req.session.clone());
    match action.as_str() {
        "auth" => auth(state, &caller, req).await,
        "checktoken" => {
            let _guard = hold(state, "token").await?;
            Ok(caller.checktoken().await?)
        }
        "deauthtoken" => {
            let _guard = hold(state, "token").await?;
            Ok(caller.deauthtoken().await?)
        }
        "app" => {
            let records = Records::load(&caller).await?;
            Ok(records.app(&req.rest_code(1)).await?)
        }
        "list" => {
            let records = Records::load(&caller).await?;
            let search = req.json_text("search").unwrap_or_default();
            let page = intval(req.json.get("page").unwrap_or(&Value::Null));
            Ok(records.list(&req.rest_code(1), &search, page).await?)
        }
        "view" => {
            let records = Records::load(&caller).await?;
            Ok(records
                .view(&req.rest_code(1), intval(&json!(req.rest(2))))
                .await?)
        }
        "insert" => {
            let records = Records::load(&caller).await?;
            let app = encode_bad_chars(&req.json_text("app").unwrap_or_default(), '_', "");
            let data = req.json.get("data").cloned().unwrap_or(Value::Null);
            Ok(records.insert(&app, &data).await?)
        }
        "update" => {
            let records = Records::load(&caller).await?;
            let data = req.json.get("data").cloned().unwrap_or(Value::Null);
            Ok(records
                .update(&req.rest_code(1), intval(&json!(req.rest(2))), &data)
                .await?)
        }
        "delete" => {
            let records = Records::load(&caller).await?;
            Ok(records
                .delete(&req.rest_code(1), intval(&json!(req.rest(2))))
                .await?)
        }
        "upload" => upload(state, &caller, req).await,
        "add" => add(state, req).await,
        "adderror" => add_error(state, req).await,
        "score" => score(state, &caller, req).await,
        "gc" => gc(state, req).await,
        _ => Err(AppError::json("Unknown request")),
    }
}

#[track_caller]
fn semaphore_error() -> AppError {
    AppError::report(ErrorReport::new(
        Section::ServerError,
        "Could not acquire the semaphore",
    ))
}

async fn hold(state: &AppState, name: &str) -> Result<SemaphoreGuard, AppError> {
    match state.semaphores.acquire(name, state.config.semaphore_timeout).await {
        Ok(guard) => Ok(guard),
        Err(err) => {
            warn!("semaphore {}: {}", name, err);
            Err(semaphore_error())
        }
    }
}

/// Fail with `<key> not found` for the first missing key.
#[track_caller]
fn require(req: &ApiRequest, keys: &[&str]) -> Result<Vec<String>, AppError> {
    keys.iter()
        .map(|key| {
            req.json_text(key)
                .ok_or_else(|| AppError::json(format!("{} not found", key)))
        })
        .collect()
}

async fn auth(state: &AppState, caller: &Caller, req: &ApiRequest) -> Result<Value, AppError> {
    let _guard = hold(state, "auth").await?;
    caller.crontab_users().await?;
    let action = req.rest_code(1);
    let value = match action.as_str() {
        "login" => {
            let args = require(req, &["user", "pass"])?;
            caller.authtoken(&args[0], &args[1]).await?
        }
        "logout" => caller.deauthtoken().await?,
        "check" => caller.checktoken().await?,
        "update" => {
            let args = require(req, &["oldpass", "newpass", "renewpass"])?;
            caller.authupdate(&args[0], &args[1], &args[2]).await?
        }
        _ => return Err(AppError::internal(format!("Unknown action {}", action))),
    };
    Ok(value)
}

async fn upload(state: &AppState, caller: &Caller, req: &ApiRequest) -> Result<Value, AppError> {
    let user_id = caller.current_user().await?;
    if user_id == 0 {
        return Err(AppError::logout("Permission denied"));
    }
    if req.json.is_empty() {
        return Err(AppError::json("file not found"));
    }
    let missing: Vec<&str> = FILE_FIELDS
        .into_iter()
        .filter(|key| !req.json.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::json(format!("Missing {}", missing.join(", "))));
    }
    let text = |key: &str| req.json_text(key).unwrap_or_default();
    let entry = FileEntry {
        id: text("id"),
        app: text("app"),
        name: text("name"),
        size: intval(req.json.get("size").unwrap_or(&Value::Null)),
        r#type: text("type"),
        data: text("data"),
        error: text("error"),
        file: text("file"),
        hash: text("hash"),
    };
    if !entry.error.is_empty() {
        return Err(AppError::json(entry.error));
    }

    let uploads = UploadService::new(state.db.clone(), state.config.upload_dir());
    let action = req.rest_code(1);
    let entry = match action.as_str() {
        "addfile" => uploads.add_file(entry, user_id).await?,
        "delfile" => uploads.del_file(entry, user_id).await?,
        _ => return Err(AppError::internal(format!("Unknown action {}", action))),
    };
    serde_json::to_value(entry).map_err(|err| AppError::internal(err.to_string()))
}

/// `add/log` appends a message to the application log, `add/error` files
/// a client side error report.
async fn add(state: &AppState, req: &ApiRequest) -> Result<Value, AppError> {
    let action = req.rest_code(1);
    match action.as_str() {
        "log" => {
            let msg = require(req, &["msg"])?;
            state
                .log
                .add_log(msg[0].as_str(), DEFAULT_LOG)
                .await
                .map_err(ServiceError::from)?;
            Ok(json!({ "status": "ok" }))
        }
        "error" => add_error(state, req).await,
        _ => Err(AppError::internal(format!("Unknown action {}", action))),
    }
}

/// File a client side error report under `jserror`.
async fn add_error(state: &AppState, req: &ApiRequest) -> Result<Value, AppError> {
    let fields = require(req, &["jserror", "details", "backtrace"])?;
    let report = ErrorReport::new(Section::JsError, fields[0].as_str())
        .with(Section::Details, fields[1].as_str())
        .with(Section::Backtrace, fields[2].as_str())
        .scrub(&state.config.private_values());
    let file = report.log_file();
    state
        .log
        .add_trace(report, &file)
        .await
        .map_err(ServiceError::from)?;
    Ok(json!({ "status": "ok" }))
}

/// Strength of a candidate password. `format` is `json` or `png`; both
/// answer with the score and the meter image inlined.
async fn score(state: &AppState, caller: &Caller, req: &ApiRequest) -> Result<Value, AppError> {
    if caller.current_user().await? == 0 {
        return Err(AppError::logout("Permission denied"));
    }
    let mut args = Vec::new();
    for key in ["pass", "format"] {
        match req.json_text(key).filter(|text| !text.is_empty()) {
            Some(text) => args.push(text),
            None => return Err(AppError::json(format!("{} not found or void", key))),
        }
    }
    if !matches!(args[1].as_str(), "json" | "png") {
        return Err(AppError::json(format!("Unknown format {}", args[1])));
    }
    let side = |key: &str, default: u32| {
        u32::try_from(intval(req.json.get(key).unwrap_or(&Value::Null)))
            .ok()
            .filter(|value| *value > 0)
            .unwrap_or(default)
    };
    Ok(score_report(
        &args[0],
        state.config.password_min_score,
        side("width", DEFAULT_WIDTH),
        side("height", DEFAULT_HEIGHT),
    )?)
}

/// Collect expired uploads and stale files. Command line only.
async fn gc(state: &AppState, req: &ApiRequest) -> Result<Value, AppError> {
    if req.method != "CLI" {
        return Err(AppError::internal("Permission denied"));
    }
    let _guard = hold(state, "gc").await?;
    let config = &state.config;
    let uploads = UploadService::new(state.db.clone(), config.upload_dir());

    let started = Instant::now();
    let upload_report = uploads.gc_upload(config.cache_timeout).await?;
    let upload_time = started.elapsed().as_secs_f64();

    let started = Instant::now();
    let exec_report = gc_exec(
        vec![config.cache_dir(), config.temp_dir(), config.upload_dir()],
        config.cache_timeout,
    )
    .await
    .map_err(ServiceError::from)?;
    let exec_time = started.elapsed().as_secs_f64();

    let with_time = |time: f64, report: Value| {
        let mut out = Map::new();
        out.insert("time".into(), json!(format!("{:.6}", time)));
        if let Value::Object(fields) = report {
            out.extend(fields);
        }
        Value::Object(out)
    };
    Ok(json!({
        "gc_upload": with_time(upload_time, upload_report),
        "gc_exec": with_time(exec_time, exec_report),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, content_type: &str, rest: &str, json: Value) -> ApiRequest {
        ApiRequest {
            method: method.into(),
            content_type: content_type.into(),
            rest: parse_rest(rest),
            json: json.as_object().cloned().unwrap_or_default(),
            session: Session::default(),
        }
    }

    #[test]
    fn rest_drops_empty_segments() {
        assert_eq!(parse_rest("/list//customers/"), vec!["list", "customers"]);
        assert!(parse_rest("").is_empty());
    }

    #[test]
    fn only_objects_count_as_json() {
        assert_eq!(parse_json(br#"{"a":1}"#).len(), 1);
        assert!(parse_json(b"[1,2]").is_empty());
        assert!(parse_json(b"not json").is_empty());
    }

    #[test]
    fn method_and_payload_must_agree() {
        let ok = [
            request("GET", "", "auth", json!({})),
            request("POST", "application/json", "auth", json!({"a": 1})),
            request("CLI", "", "gc", json!({})),
        ];
        for req in ok {
            assert!(req.validate().is_ok(), "{:?}", req.method);
        }
        let bad = [
            request("GET", "", "", json!({})),
            request("GET", "text/plain", "auth", json!({})),
            request("GET", "", "auth", json!({"a": 1})),
            request("POST", "application/json", "auth", json!({})),
            request("POST", "text/plain", "auth", json!({"a": 1})),
            request("PUT", "", "auth", json!({})),
        ];
        for req in bad {
            let err = req.validate().unwrap_err();
            assert_eq!(err.message(), "Unknown request");
        }
    }

    #[test]
    fn cli_requests_use_stdin_and_token() {
        let rest = vec!["gc".to_string()];
        let req = ApiRequest::from_cli(&rest, "", "", "root");
        assert_eq!(req.method, "CLI");
        assert_eq!(req.rest(0), "gc");
        assert_eq!(req.rest(5), "");
        assert_eq!(req.session.remote_addr, "root");
    }

    async fn logged_in(app: &crate::test_support::TestApp) -> ApiRequest {
        app.add_user(2, "alice", "Al1ce!Secret", 1).await;
        let token = app.login("alice", "Al1ce!Secret").await;
        ApiRequest {
            session: crate::test_support::session(&token),
            ..request("POST", "application/json", "score", json!({}))
        }
    }

    #[tokio::test]
    async fn client_errors_are_filed_as_jserror() {
        let app = crate::test_support::TestApp::new().await;
        for rest in ["adderror", "add/error"] {
            let req = request(
                "POST",
                "application/json",
                rest,
                json!({"jserror": "x is undefined", "details": "app.js:10", "backtrace": "at f()"}),
            );
            let answer = handle(&app.state, &req).await.unwrap();
            assert_eq!(answer["status"], "ok");
        }
        let logged = std::fs::read_to_string(app.state.log.dir().join("jserror.log")).unwrap();
        assert_eq!(logged.matches("x is undefined").count(), 1);
        let markers = logged
            .lines()
            .filter_map(|line| line.split(": ").nth(1))
            .filter_map(|text| text.strip_prefix("***** ")?.strip_suffix(" *****"))
            .filter(|hash| hash.len() == 32 && hash.chars().all(|c| c.is_ascii_hexdigit()))
            .count();
        assert_eq!(markers, 2);

        let partial = request("POST", "application/json", "add/error", json!({"jserror": "x"}));
        let err = handle(&app.state, &partial).await.unwrap_err();
        assert_eq!(err.message(), "details not found");
    }

    #[tokio::test]
    async fn messages_are_added_to_the_log() {
        let app = crate::test_support::TestApp::new().await;
        let req = request("POST", "application/json", "add/log", json!({"msg": "cache warmed"}));
        assert_eq!(handle(&app.state, &req).await.unwrap()["status"], "ok");
        let logged = std::fs::read_to_string(app.state.log.dir().join(DEFAULT_LOG)).unwrap();
        assert!(logged.trim_end().ends_with(": cache warmed"));

        let missing = request("POST", "application/json", "add/log", json!({"other": 1}));
        assert_eq!(handle(&app.state, &missing).await.unwrap_err().message(), "msg not found");

        let unknown = request("POST", "application/json", "add/push", json!({"msg": "x"}));
        let err = handle(&app.state, &unknown).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Report(_)));
        assert_eq!(err.message(), "Unknown action push");
    }

    #[tokio::test]
    async fn password_scores_need_a_session_and_a_format() {
        let app = crate::test_support::TestApp::new().await;
        let anonymous = request("POST", "application/json", "score", json!({"pass": "x", "format": "json"}));
        let err = handle(&app.state, &anonymous).await.unwrap_err();
        assert_eq!(err.message(), "Permission denied");
        assert_eq!(err.body()["logout"], true);

        let base = logged_in(&app).await;
        let with = |json: Value| ApiRequest {
            json: json.as_object().cloned().unwrap_or_default(),
            ..base.clone()
        };

        let err = handle(&app.state, &with(json!({"pass": "", "format": "json"}))).await.unwrap_err();
        assert_eq!(err.message(), "pass not found or void");
        let err = handle(&app.state, &with(json!({"pass": "x"}))).await.unwrap_err();
        assert_eq!(err.message(), "format not found or void");
        let err = handle(&app.state, &with(json!({"pass": "x", "format": "gif"}))).await.unwrap_err();
        assert_eq!(err.message(), "Unknown format gif");

        let strong = handle(&app.state, &with(json!({"pass": "Str0ng!Passw0rd", "format": "json"})))
            .await
            .unwrap();
        assert_eq!(strong["valid"], "ok");
        assert!(strong["score"].as_str().unwrap().ends_with('%'));
        let weak = handle(&app.state, &with(json!({"pass": "abc", "format": "png", "width": 120})))
            .await
            .unwrap();
        assert_eq!(weak["valid"], "ko");
        assert!(weak["image"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }
}
