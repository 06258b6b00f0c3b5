pub mod auth;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod lifecycle;
pub mod server;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: lifecycle::Lifecycle,
    /// Bearer token guarding the admin routes. Admin routes are disabled when unset.
    pub admin_token: Option<String>,
    /// Header carrying the identity asserted by the upstream auth layer.
    pub owner_header: String,
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub use error::EngineError;
pub use lifecycle::{Lifecycle, NewSecret, Policy, ShareLink, ViewResult};
pub use server::{read_token_file, resolve_data_dir, run, ServerConfig};
