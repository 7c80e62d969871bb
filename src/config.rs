use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Driver name: `sqlite`, `pdo_sqlite`, `sqlite3`, `mysql`, `pdo_mysql` or `mysqli`.
    pub db_type: String,
    pub database_url: String,
    /// Root for logs, uploads, cache, temp files and semaphores.
    pub data_dir: PathBuf,
    pub semaphore_timeout: Duration,
    /// Seconds a token stays valid without activity.
    pub token_short_expires: i64,
    /// Seconds a token stays valid at most, counted from its creation.
    pub token_long_expires: i64,
    pub password_expires: i64,
    pub password_min_score: u32,
    /// Age in seconds after which cache, temp and upload files are collected.
    pub cache_timeout: i64,
    /// Queries slower than this many seconds are traced to the dbwarning log.
    pub slow_query_time: Option<f64>,
    pub log_max_file_size: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "SaltOS application server")]
pub struct Args {
    /// Host to bind to (overrides SALTOS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SALTOS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database driver (overrides SALTOS_DB_TYPE)
    #[arg(long)]
    pub db_type: Option<String>,

    /// Database URL (overrides SALTOS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Data directory (overrides SALTOS_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Serve a single request path (e.g. `gc` or `auth/check`) and exit
    pub rest: Vec<String>,
}

/// What the binary should do once configuration is loaded.
#[derive(Debug, Clone, Default)]
pub struct LaunchMode {
    pub migrate: bool,
    pub rest: Vec<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the launch mode.
    pub fn from_env_and_args() -> Result<(Self, LaunchMode)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("SALTOS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("SALTOS_PORT", 8080u16)?;
        let env_type = env::var("SALTOS_DB_TYPE").unwrap_or_else(|_| "pdo_sqlite".into());
        let env_data = env::var("SALTOS_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let env_db = env::var("SALTOS_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/saltos.sqlite".into());

        let data_dir = args.data_dir.unwrap_or_else(|| PathBuf::from(env_data));
        let database_url = args.database_url.unwrap_or(env_db);

        // --- Merge ---
        let mut cfg = Self::for_data_dir(data_dir, database_url);
        cfg.host = args.host.unwrap_or(env_host);
        cfg.port = args.port.unwrap_or(env_port);
        cfg.db_type = args.db_type.unwrap_or(env_type);
        cfg.semaphore_timeout =
            Duration::from_micros(env_parse("SALTOS_SEMAPHORE_TIMEOUT", 10_000_000u64)?);
        cfg.token_short_expires = env_parse("SALTOS_TOKEN_SHORT_EXPIRES", cfg.token_short_expires)?;
        cfg.token_long_expires = env_parse("SALTOS_TOKEN_LONG_EXPIRES", cfg.token_long_expires)?;
        cfg.password_expires = env_parse("SALTOS_PASSWORD_EXPIRES", cfg.password_expires)?;
        cfg.password_min_score = env_parse("SALTOS_PASSWORD_MIN_SCORE", cfg.password_min_score)?;
        cfg.cache_timeout = env_parse("SALTOS_CACHE_TIMEOUT", cfg.cache_timeout)?;
        cfg.log_max_file_size = env_parse("SALTOS_LOG_MAX_FILE_SIZE", cfg.log_max_file_size)?;
        cfg.slow_query_time = match env::var("SALTOS_SLOW_QUERY_TIME") {
            Ok(value) => Some(
                value
                    .parse::<f64>()
                    .with_context(|| format!("parsing SALTOS_SLOW_QUERY_TIME value `{}`", value))?,
            ),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err).context("reading SALTOS_SLOW_QUERY_TIME"),
        };

        let mode = LaunchMode {
            migrate: args.migrate,
            rest: args.rest,
        };
        Ok((cfg, mode))
    }

    /// Defaults rooted at `data_dir`, used by the binary before env/CLI
    /// overrides and directly by tests.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            db_type: "pdo_sqlite".into(),
            database_url: database_url.into(),
            data_dir: data_dir.into(),
            semaphore_timeout: Duration::from_secs(10),
            token_short_expires: 3600,
            token_long_expires: 86400,
            password_expires: 31_536_000,
            password_min_score: 60,
            cache_timeout: 86400,
            slow_query_time: None,
            log_max_file_size: 100 * 1024 * 1024,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("upload")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("temp")
    }

    pub fn semaphore_dir(&self) -> PathBuf {
        self.data_dir.join("semaphores")
    }

    /// Every directory the server writes to.
    pub fn directories(&self) -> Vec<PathBuf> {
        vec![
            self.logs_dir(),
            self.upload_dir(),
            self.cache_dir(),
            self.temp_dir(),
            self.semaphore_dir(),
        ]
    }

    /// Connection secrets that must never reach a log file or a client.
    pub fn private_values(&self) -> Vec<String> {
        let mut values = Vec::new();
        if let Ok(url) = url::Url::parse(&self.database_url) {
            if let Some(host) = url.host_str() {
                values.push(host.to_string());
            }
            if let Some(port) = url.port() {
                values.push(port.to_string());
            }
            if !url.username().is_empty() {
                values.push(url.username().to_string());
            }
            if let Some(pass) = url.password() {
                values.push(pass.to_string());
            }
            let path = url.path().trim_start_matches('/');
            if !path.is_empty() {
                values.push(path.to_string());
            }
        }
        if let Some(file) = sqlite_file(&self.database_url) {
            values.push(file.to_string());
        }
        values.retain(|value| value.len() > 1);
        values.sort_by_key(|value| std::cmp::Reverse(value.len()));
        values.dedup();
        values
    }
}

/// Extract the local file path from a SQLite URL, if it names one.
pub fn sqlite_file(database_url: &str) -> Option<&str> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.trim_start_matches("file:");
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
