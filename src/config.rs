//! Environment-driven configuration, read once at startup.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::warn;

pub const SESSION_TTL_MS: i64 = 8 * 60 * 60 * 1000;
pub const SESSION_ROTATE_MS: i64 = 30 * 60 * 1000;
pub const DEFAULT_ARCHIVE_LARGE_MB: u64 = 100;
pub const DEFAULT_SEARCH_MAX_BYTES: u64 = 200 * 1024;
pub const DEFAULT_MAX_S3_CONNECTIONS: usize = 5;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host directory every user root must live under.
    pub file_root: PathBuf,
    /// HMAC key for session tokens. Generated per-process when unset.
    pub session_secret: Vec<u8>,
    pub admin_password: Option<String>,
    pub users_file: Option<PathBuf>,
    pub users_json: Option<String>,
    pub archive_large_bytes: u64,
    pub search_max_bytes: u64,
    pub audit_log_path: PathBuf,
    pub max_s3_connections: usize,
    pub http_port: u16,
    /// Directory holding settings.json (S3 profiles).
    pub data_dir: PathBuf,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let file_root = PathBuf::from(env_opt("FILE_ROOT").unwrap_or_else(|| "files".to_string()));

        let session_secret = match env_opt("SESSION_SECRET") {
            Some(s) => s.into_bytes(),
            None => {
                warn!("SESSION_SECRET not set; generating a per-process secret (sessions will not survive a restart)");
                let mut buf = [0u8; 32];
                getrandom::getrandom(&mut buf).context("generating session secret")?;
                buf.to_vec()
            }
        };

        let archive_large_mb: u64 = match env_opt("ARCHIVE_LARGE_MB") {
            Some(v) => v.parse().with_context(|| format!("ARCHIVE_LARGE_MB is not a number: {v}"))?,
            None => DEFAULT_ARCHIVE_LARGE_MB,
        };
        let search_max_bytes: u64 = match env_opt("SEARCH_MAX_BYTES") {
            Some(v) => v.parse().with_context(|| format!("SEARCH_MAX_BYTES is not a number: {v}"))?,
            None => DEFAULT_SEARCH_MAX_BYTES,
        };
        let max_s3_connections: usize = match env_opt("MAX_S3_CONNECTIONS") {
            Some(v) => v.parse().with_context(|| format!("MAX_S3_CONNECTIONS is not a number: {v}"))?,
            None => DEFAULT_MAX_S3_CONNECTIONS,
        };
        let http_port: u16 = match env_opt("DEPOT_HTTP_PORT") {
            Some(v) => v.parse().with_context(|| format!("DEPOT_HTTP_PORT is not a port: {v}"))?,
            None => 7878,
        };

        Ok(Config {
            file_root,
            session_secret,
            admin_password: env_opt("ADMIN_PASSWORD"),
            users_file: env_opt("USERS_FILE").map(PathBuf::from),
            users_json: env_opt("USERS_JSON"),
            archive_large_bytes: archive_large_mb * 1024 * 1024,
            search_max_bytes,
            audit_log_path: PathBuf::from(env_opt("AUDIT_LOG_PATH").unwrap_or_else(|| "audit.log".to_string())),
            max_s3_connections,
            http_port,
            data_dir: PathBuf::from(env_opt("DEPOT_DATA_DIR").unwrap_or_else(|| "data".to_string())),
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}
