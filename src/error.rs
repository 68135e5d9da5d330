//! Unified application error model and HTTP mapping helpers.
//! A single enum is used across the request handlers and the storage
//! adapters; the outermost handler maps variants 1:1 to status codes and
//! never surfaces internal types on the wire.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppError {
    Unauthorized { message: String },
    Forbidden { message: String },
    NotFound { message: String },
    Conflict { message: String },
    PayloadTooLarge { message: String },
    InvalidPath { message: String },
    InvalidRequest { message: String },
    Escape { message: String },
    AtLimit { message: String },
    Upstream { message: String },
}

impl AppError {
    pub fn message(&self) -> &str {
        match self {
            AppError::Unauthorized { message }
            | AppError::Forbidden { message }
            | AppError::NotFound { message }
            | AppError::Conflict { message }
            | AppError::PayloadTooLarge { message }
            | AppError::InvalidPath { message }
            | AppError::InvalidRequest { message }
            | AppError::Escape { message }
            | AppError::AtLimit { message }
            | AppError::Upstream { message } => message.as_str(),
        }
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self { AppError::Unauthorized { message: msg.into() } }
    pub fn forbidden<S: Into<String>>(msg: S) -> Self { AppError::Forbidden { message: msg.into() } }
    pub fn not_found<S: Into<String>>(msg: S) -> Self { AppError::NotFound { message: msg.into() } }
    pub fn conflict<S: Into<String>>(msg: S) -> Self { AppError::Conflict { message: msg.into() } }
    pub fn too_large<S: Into<String>>(msg: S) -> Self { AppError::PayloadTooLarge { message: msg.into() } }
    pub fn invalid_path<S: Into<String>>(msg: S) -> Self { AppError::InvalidPath { message: msg.into() } }
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self { AppError::InvalidRequest { message: msg.into() } }
    pub fn escape<S: Into<String>>(msg: S) -> Self { AppError::Escape { message: msg.into() } }
    pub fn at_limit<S: Into<String>>(msg: S) -> Self { AppError::AtLimit { message: msg.into() } }
    pub fn upstream<S: Into<String>>(msg: S) -> Self { AppError::Upstream { message: msg.into() } }

    /// Map to an HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Unauthorized { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::PayloadTooLarge { .. } => 413,
            AppError::InvalidPath { .. } => 400,
            AppError::InvalidRequest { .. } => 400,
            // Rendered as a generic not-found so callers cannot probe for
            // entries outside their root.
            AppError::Escape { .. } => 404,
            AppError::AtLimit { .. } => 400,
            AppError::Upstream { .. } => 500,
        }
    }

    /// The message surfaced on the wire. Escape collapses to the same body a
    /// missing entry produces.
    pub fn public_message(&self) -> &str {
        match self {
            AppError::Escape { .. } => "Path not found.",
            other => other.message(),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::not_found("Path not found."),
            std::io::ErrorKind::AlreadyExists => AppError::conflict("Destination already exists."),
            _ => AppError::upstream(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::unauthorized("no").http_status(), 401);
        assert_eq!(AppError::forbidden("no").http_status(), 403);
        assert_eq!(AppError::not_found("missing").http_status(), 404);
        assert_eq!(AppError::conflict("dup").http_status(), 409);
        assert_eq!(AppError::too_large("big").http_status(), 413);
        assert_eq!(AppError::invalid_path("bad").http_status(), 400);
        assert_eq!(AppError::invalid_request("bad").http_status(), 400);
        assert_eq!(AppError::escape("out").http_status(), 404);
        assert_eq!(AppError::at_limit("cap").http_status(), 400);
        assert_eq!(AppError::upstream("io").http_status(), 500);
    }

    #[test]
    fn escape_is_indistinguishable_from_not_found() {
        let esc = AppError::escape("resolved outside /data/u");
        let nf = AppError::not_found("Path not found.");
        assert_eq!(esc.http_status(), nf.http_status());
        assert_eq!(esc.public_message(), nf.public_message());
        // The internal message keeps the detail for logs.
        assert_ne!(esc.message(), esc.public_message());
    }
}
