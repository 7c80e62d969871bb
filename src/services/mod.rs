//! Domain services shared by the HTTP and CLI front ends.

pub mod app_log;
pub mod apps;
pub mod auth_service;
pub mod gc;
pub mod log_service;
pub mod password;
pub mod perms;
pub mod records;
pub mod score;
pub mod upload_service;
pub mod version;

use crate::{
    config::AppConfig,
    db::{Database, DbError, semaphore::{SemaphoreError, Semaphores}},
    errors::ErrorReport,
};
use log_service::LogService;
use std::{io, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Db(#[from] DbError),
    /// Refused request answered with a plain JSON error.
    #[error("{0}")]
    Rejected(String),
    /// Refused request that also sends the client back to the login screen.
    #[error("{0}")]
    Logout(String),
    /// Internal failure that must reach the error logs.
    #[error("{0}")]
    Report(ErrorReport),
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServiceError {
    #[track_caller]
    pub fn internal(msg: impl Into<String>) -> Self {
        ServiceError::Report(ErrorReport::new(crate::errors::Section::ServerError, msg))
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        ServiceError::Rejected(msg.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Everything a request needs; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub log: LogService,
    pub semaphores: Semaphores,
}

impl AppState {
    pub fn new(config: AppConfig, db: Database) -> Self {
        let log = LogService::new(config.logs_dir(), config.log_max_file_size);
        let semaphores = Semaphores::new(config.semaphore_dir());
        Self {
            config: Arc::new(config),
            db,
            log,
            semaphores,
        }
    }
}
