use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin,
    handlers::{
        access_log, create_secret, health, list_owned, revoke_secret, sweep_secrets, view_secret,
    },
    lifecycle::{Lifecycle, Policy},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub admin_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    /// Trusted header carrying the authenticated account ($BURNLINK_OWNER_HEADER).
    pub owner_header: String,
    pub policy: Policy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = Policy::default();
        Self {
            host: std::env::var("BURNLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("BURNLINK_PORT", 8080),
            admin_token: std::env::var("BURNLINK_ADMIN_TOKEN").ok(),
            data_dir: std::env::var("BURNLINK_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(env_or("BURNLINK_SWEEP_INTERVAL_SECS", 300)),
            cors_origins: std::env::var("BURNLINK_CORS_ORIGINS").ok(),
            owner_header: std::env::var("BURNLINK_OWNER_HEADER")
                .unwrap_or_else(|_| "x-authenticated-user".into()),
            policy: Policy {
                max_text_bytes: env_or("BURNLINK_MAX_TEXT_BYTES", defaults.max_text_bytes),
                max_file_bytes: env_or("BURNLINK_MAX_FILE_BYTES", defaults.max_file_bytes),
                min_ttl: Duration::from_secs(env_or(
                    "BURNLINK_MIN_TTL_SECS",
                    defaults.min_ttl.as_secs(),
                )),
                max_ttl: Duration::from_secs(env_or(
                    "BURNLINK_MAX_TTL_SECS",
                    defaults.max_ttl.as_secs(),
                )),
                max_views: env_or("BURNLINK_MAX_VIEWS", defaults.max_views),
            },
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a token from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_token_file(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read token file: {}", path.display()))?;
    let token = content.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("token file is empty: {}", path.display());
    }
    Ok(token)
}

/// Resolve the admin token from `BURNLINK_ADMIN_TOKEN_FILE` (preferred) or
/// `BURNLINK_ADMIN_TOKEN`. Returns `None` when neither is set.
pub fn resolve_admin_token() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("BURNLINK_ADMIN_TOKEN_FILE") {
        let token = read_token_file(std::path::Path::new(&path))?;
        if std::env::var("BURNLINK_ADMIN_TOKEN").is_ok() {
            warn!("both BURNLINK_ADMIN_TOKEN and BURNLINK_ADMIN_TOKEN_FILE are set; using file");
        }
        return Ok(Some(token));
    }
    Ok(std::env::var("BURNLINK_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty()))
}

/// Resolve and create the data directory.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Build the router. Split out from `run` so it can be mounted elsewhere.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Public routes. Owner routes rely on the trusted owner header.
    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets", post(create_secret))
        .route("/secrets", get(list_owned))
        .route("/secrets/{id}/view", post(view_secret))
        .route("/secrets/{id}", delete(revoke_secret));

    // Admin routes (bearer admin token required).
    let admin = Router::new()
        .route("/audit", get(access_log))
        .route("/sweep", post(sweep_secrets))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    // Base64 inflates uploads by 4/3; leave headroom for the JSON envelope.
    let body_limit = state.lifecycle.policy().max_file_bytes / 3 * 4 + 64 * 1024;

    Router::new()
        .merge(public)
        .merge(admin)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let db_path = data_dir.join("burnlink.db");
    let store = crate::store::Store::open(&db_path).context("open store")?;

    // Expiry is enforced on every consume; the sweep only reclaims space.
    store.clone().spawn_sweep(cfg.sweep_interval);

    if cfg.admin_token.is_none() {
        warn!("no admin token configured; /audit and /sweep are disabled");
    }

    let state = AppState {
        lifecycle: Lifecycle::new(store, cfg.policy),
        admin_token: cfg.admin_token,
        owner_header: cfg.owner_header.to_ascii_lowercase(),
    };

    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnlink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.token");
        std::fs::write(&path, "  s3cret-token\n").unwrap();
        assert_eq!(read_token_file(&path).unwrap(), "s3cret-token");
    }

    #[test]
    fn empty_token_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.token");
        std::fs::write(&path, "\n\n").unwrap();
        assert!(read_token_file(&path).is_err());
    }

    #[test]
    fn env_or_uses_default_when_unset() {
        assert_eq!(env_or("BURNLINK_TEST_UNSET_VARIABLE", 7u32), 7);
    }
}
