//! Error reports and the JSON error envelope.
//!
//! An [`ErrorReport`] is an ordered list of titled sections. The first
//! category section decides which log file receives it; the text form goes to
//! the log and the JSON form `{text, code}` goes to the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::{fmt, panic::Location, path::Path};

use crate::{db::DbError, services::ServiceError};

/// Fallback log for reports without a category.
pub const DEFAULT_ERROR_LOG: &str = "error.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    DbError,
    ServerError,
    XmlError,
    JsError,
    DbWarning,
    ServerWarning,
    XmlWarning,
    JsWarning,
    Deprecated,
    Source,
    Details,
    Query,
    Params,
    Backtrace,
    Debug,
}

/// Category sections in the order they are looked up to pick a log file.
const CATEGORIES: [Section; 9] = [
    Section::DbError,
    Section::ServerError,
    Section::XmlError,
    Section::JsError,
    Section::DbWarning,
    Section::ServerWarning,
    Section::XmlWarning,
    Section::JsWarning,
    Section::Deprecated,
];

impl Section {
    pub fn title(&self) -> &'static str {
        match self {
            Section::DbError => "DB Error",
            Section::ServerError => "Server Error",
            Section::XmlError => "XML Error",
            Section::JsError => "JS Error",
            Section::DbWarning => "DB Warning",
            Section::ServerWarning => "Server Warning",
            Section::XmlWarning => "XML Warning",
            Section::JsWarning => "JS Warning",
            Section::Deprecated => "Deprecated",
            Section::Source => "Source",
            Section::Details => "Details",
            Section::Query => "Query",
            Section::Params => "Params",
            Section::Backtrace => "Backtrace",
            Section::Debug => "Debug",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Section::DbError => "dberror",
            Section::ServerError => "servererror",
            Section::XmlError => "xmlerror",
            Section::JsError => "jserror",
            Section::DbWarning => "dbwarning",
            Section::ServerWarning => "serverwarning",
            Section::XmlWarning => "xmlwarning",
            Section::JsWarning => "jswarning",
            Section::Deprecated => "deprecated",
            Section::Source => "source",
            Section::Details => "details",
            Section::Query => "query",
            Section::Params => "params",
            Section::Backtrace => "backtrace",
            Section::Debug => "debug",
        }
    }

    pub fn is_category(&self) -> bool {
        CATEGORIES.contains(self)
    }

    /// Log file of a category section, `None` for the descriptive ones.
    pub fn log_file(&self) -> Option<String> {
        self.is_category().then(|| format!("{}.log", self.key()))
    }
}

/// `file_stem:line` of a source location.
pub fn code_from_location(location: &Location<'_>) -> String {
    let stem = Path::new(location.file())
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("unknown");
    format!("{}:{}", stem, location.line())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    sections: Vec<(Section, String)>,
    code: String,
}

impl ErrorReport {
    /// Start a report with its first section; the code points at the caller.
    #[track_caller]
    pub fn new(section: Section, text: impl Into<String>) -> Self {
        Self {
            sections: Vec::new(),
            code: code_from_location(Location::caller()),
        }
        .with(section, text)
    }

    /// Append a section; blank bodies are dropped.
    pub fn with(mut self, section: Section, text: impl Into<String>) -> Self {
        let text = text.into();
        let text = text.trim();
        if !text.is_empty() {
            self.sections.push((section, text.to_string()));
        }
        self
    }

    /// Append a `key => value` listing section.
    pub fn with_pairs<'a>(
        self,
        section: Section,
        pairs: impl IntoIterator<Item = (&'a str, String)>,
    ) -> Self {
        let body = pairs
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{} => {}", key, value))
            .collect::<Vec<_>>()
            .join("\n");
        self.with(section, body)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn sections(&self) -> &[(Section, String)] {
        &self.sections
    }

    pub fn has(&self, section: Section) -> bool {
        self.sections.iter().any(|(s, _)| *s == section)
    }

    /// The category deciding the log file. A server error mentioning
    /// "deprecated" is filed as `deprecated`.
    pub fn category(&self) -> Option<Section> {
        let deprecated = self.sections.iter().any(|(section, text)| {
            *section == Section::ServerError && text.to_lowercase().contains("deprecated")
        });
        CATEGORIES.into_iter().find(|category| match category {
            Section::ServerError if deprecated => false,
            Section::Deprecated if deprecated => true,
            other => self.has(*other),
        })
    }

    pub fn log_file(&self) -> String {
        self.category()
            .and_then(|category| category.log_file())
            .unwrap_or_else(|| DEFAULT_ERROR_LOG.to_string())
    }

    /// Replace connection secrets in the `dberror` section by `...`.
    pub fn scrub(mut self, private: &[String]) -> Self {
        for (section, text) in self.sections.iter_mut() {
            if *section == Section::DbError {
                for value in private.iter().filter(|value| !value.is_empty()) {
                    *text = text.replace(value.as_str(), "...");
                }
            }
        }
        self
    }

    /// Text of the first section, the message shown to clients.
    pub fn message(&self) -> &str {
        self.sections
            .first()
            .map(|(_, text)| text.as_str())
            .unwrap_or_default()
    }

    /// Log form: `***** Title *****` followed by the body, per section.
    pub fn text(&self) -> String {
        self.sections
            .iter()
            .map(|(section, text)| format!("***** {} *****\n{}", section.title(), text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn json(&self) -> Value {
        json!({ "text": self.message(), "code": self.code })
    }

    /// md5 of the text form, the de-duplication key in log files.
    pub fn hash(&self) -> String {
        format!("{:x}", md5::compute(self.text()))
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// What the client receives when an action fails.
#[derive(Debug)]
pub enum ErrorKind {
    /// Logged to the category file before answering.
    Report(ErrorReport),
    /// Controlled error answered as-is, never logged.
    Json {
        text: String,
        code: String,
        logout: bool,
    },
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: ErrorKind,
}

impl AppError {
    /// A controlled error, the `show_json_error` path.
    #[track_caller]
    pub fn json(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            kind: ErrorKind::Json {
                text: msg.into(),
                code: code_from_location(Location::caller()),
                logout: false,
            },
        }
    }

    /// A controlled error that also asks the client to show the login screen.
    #[track_caller]
    pub fn logout(msg: impl Into<String>) -> Self {
        let mut err = Self::json(msg);
        if let ErrorKind::Json { logout, .. } = &mut err.kind {
            *logout = true;
        }
        err
    }

    pub fn report(report: ErrorReport) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Report(report),
        }
    }

    /// Shortcut for a logged server error.
    #[track_caller]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::report(ErrorReport::new(Section::ServerError, msg))
    }

    pub fn message(&self) -> &str {
        match &self.kind {
            ErrorKind::Report(report) => report.message(),
            ErrorKind::Json { text, .. } => text,
        }
    }

    /// The response body `{"error": {text, code}}`, with `logout` when set.
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        match &self.kind {
            ErrorKind::Report(report) => {
                body.insert("error".into(), report.json());
            }
            ErrorKind::Json { text, code, logout } => {
                body.insert("error".into(), json!({ "text": text, "code": code }));
                if *logout {
                    body.insert("logout".into(), Value::Bool(true));
                }
            }
        }
        Value::Object(body)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<DbError> for ErrorReport {
    #[track_caller]
    fn from(err: DbError) -> Self {
        let query = err.query().map(str::to_string);
        let report = ErrorReport::new(err.section(), err.to_string());
        match query {
            Some(query) => report.with(Section::Query, query),
            None => report,
        }
    }
}

impl From<DbError> for AppError {
    #[track_caller]
    fn from(err: DbError) -> Self {
        AppError::report(ErrorReport::from(err))
    }
}

impl From<ServiceError> for AppError {
    #[track_caller]
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Db(err) => AppError::from(err),
            ServiceError::Rejected(text) => AppError::json(text),
            ServiceError::Logout(text) => AppError::logout(text),
            ServiceError::Report(report) => AppError::report(report),
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
