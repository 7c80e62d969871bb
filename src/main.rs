use anyhow::{Context, Result};
use saltos::{
    config::{AppConfig, LaunchMode, sqlite_file},
    db::Database,
    handlers::api_handlers::{ApiRequest, handle},
    services::{AppState, log_service::LogService},
};
use std::{
    env, fs,
    io::{ErrorKind, IsTerminal},
    net::SocketAddr,
    path::Path,
};
use tokio::{io::AsyncReadExt, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + launch mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting saltos with config: {:?}", cfg);

    // --- Ensure data directories exist ---
    for dir in cfg.directories() {
        if !dir.exists() {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            tracing::info!("Created directory {}", dir.display());
        }
    }

    // --- Create the SQLite file on first start ---
    if let Some(file) = sqlite_file(&cfg.database_url) {
        let path = Path::new(file);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::File::create(path).with_context(|| format!("creating database {}", file))?;
            tracing::info!("Created database file {}", file);
        }
    }

    let db = Database::connect(&cfg, LogService::new(cfg.logs_dir(), cfg.log_max_file_size))
        .await
        .context("connecting to the database")?;

    // --- Handle migration mode ---
    if mode.migrate {
        let count = saltos::migrate(&db).await?;
        tracing::info!("Database migration complete ({} statements).", count);
        db.disconnect().await;
        return Ok(());
    }

    let state = AppState::new(cfg, db);
    if !mode.rest.is_empty() {
        return run_cli(state, &mode).await;
    }

    // --- Start server ---
    let app = saltos::create_app(state.clone());
    let addr = state.config.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(state.config.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", state.config.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    state.db.disconnect().await;
    Ok(())
}

/// Serve one request from the command line: the path comes from the
/// arguments, the JSON body from stdin, the token and user from `TOKEN` and
/// `USER`. The response goes to stdout.
async fn run_cli(state: AppState, mode: &LaunchMode) -> Result<()> {
    let mut stdin = String::new();
    if !std::io::stdin().is_terminal() {
        tokio::io::stdin().read_to_string(&mut stdin).await?;
    }
    let token = env::var("TOKEN").unwrap_or_default();
    let user = env::var("USER").unwrap_or_default();
    let req = ApiRequest::from_cli(&mode.rest, &stdin, &token, &user);

    let body = match handle(&state, &req).await {
        Ok(value) => serde_json::to_string(&value)?,
        Err(err) => {
            tracing::warn!("{} failed: {}", mode.rest.join("/"), err.message());
            serde_json::to_string(&err.body())?
        }
    };
    println!("{}", body);
    state.db.disconnect().await;
    Ok(())
}
