//! Stateless signed session tokens.
//!
//! A token is `base64url(payload) "." base64url(HMAC-SHA256(secret,
//! payload))` where the payload is canonical JSON `{user, nonce, exp}`.
//! Verification recomputes the MAC and compares in constant time; any
//! structural anomaly collapses to the same generic Unauthorized. There is
//! no server-side session table, so horizontal scaling only requires a
//! shared secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::{SESSION_ROTATE_MS, SESSION_TTL_MS};
use crate::error::{AppError, AppResult};
use crate::users::{User, UserRegistry};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    user: String,
    nonce: String,
    exp: i64,
}

/// A verified session: the resolved user plus the token's identity fields.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub user: User,
    pub nonce: String,
    pub exp: i64,
}

impl VerifiedSession {
    /// Rotation is due once the remaining lifetime drops to the threshold.
    pub fn needs_rotation(&self, now_ms: i64) -> bool {
        self.exp - now_ms <= SESSION_ROTATE_MS
    }
}

pub struct SessionAuthority {
    secret: Vec<u8>,
    users: Arc<UserRegistry>,
}

fn unauthorized() -> AppError {
    AppError::unauthorized("Not authenticated.")
}

impl SessionAuthority {
    pub fn new(secret: Vec<u8>, users: Arc<UserRegistry>) -> Self {
        Self { secret, users }
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn issue(&self, user: &User) -> String {
        self.issue_at(user, chrono::Utc::now().timestamp_millis())
    }

    pub fn issue_at(&self, user: &User, now_ms: i64) -> String {
        let payload = TokenPayload {
            user: user.username.clone(),
            nonce: Uuid::new_v4().to_string(),
            exp: now_ms + SESSION_TTL_MS,
        };
        let bytes = serde_json::to_vec(&payload).expect("token payload serializes");
        let sig = self.sign(&bytes);
        format!("{}.{}", URL_SAFE_NO_PAD.encode(&bytes), URL_SAFE_NO_PAD.encode(sig))
    }

    pub fn verify(&self, token: &str) -> AppResult<VerifiedSession> {
        self.verify_at(token, chrono::Utc::now().timestamp_millis())
    }

    pub fn verify_at(&self, token: &str, now_ms: i64) -> AppResult<VerifiedSession> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or_else(unauthorized)?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| unauthorized())?;
        let presented_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| unauthorized())?;
        let expected_sig = self.sign(&payload);
        if !bool::from(expected_sig.ct_eq(&presented_sig)) {
            return Err(unauthorized());
        }
        let parsed: TokenPayload = serde_json::from_slice(&payload).map_err(|_| unauthorized())?;
        if parsed.exp <= now_ms {
            return Err(unauthorized());
        }
        let user = self.users.find(&parsed.user).ok_or_else(unauthorized)?;
        Ok(VerifiedSession {
            user: user.clone(),
            nonce: parsed.nonce,
            exp: parsed.exp,
        })
    }

    /// Password check for login. Returns the user on success; the error
    /// distinguishes an unknown user from a bad password for the audit log
    /// only — callers surface one generic message for both.
    pub fn check_login(&self, username: &str, password: &str) -> Result<User, LoginFailure> {
        let Some(user) = self.users.find(username) else {
            return Err(LoginFailure::UserNotFound);
        };
        if user.verify_secret(password) {
            Ok(user.clone())
        } else {
            Err(LoginFailure::BadPassword)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    UserNotFound,
    BadPassword,
}

impl LoginFailure {
    pub fn audit_reason(self) -> &'static str {
        match self {
            LoginFailure::UserNotFound => "user_not_found",
            LoginFailure::BadPassword => "bad_password",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry(tmp: &tempfile::TempDir) -> Arc<UserRegistry> {
        let config = Config {
            file_root: tmp.path().to_path_buf(),
            session_secret: b"test-secret".to_vec(),
            admin_password: None,
            users_file: None,
            users_json: Some(
                r#"[{"username":"alice","role":"read-write","secret":"pw"}]"#.to_string(),
            ),
            archive_large_bytes: 1,
            search_max_bytes: 1,
            audit_log_path: tmp.path().join("audit.log"),
            max_s3_connections: 5,
            http_port: 0,
            data_dir: tmp.path().join("data"),
        };
        Arc::new(UserRegistry::load(&config).unwrap())
    }

    fn authority(users: Arc<UserRegistry>) -> SessionAuthority {
        SessionAuthority::new(b"test-secret".to_vec(), users)
    }

    #[test]
    fn issue_then_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users.clone());
        let alice = users.find("alice").unwrap();

        let t0 = 1_700_000_000_000i64;
        let token = auth.issue_at(alice, t0);
        let v = auth.verify_at(&token, t0 + 1).unwrap();
        assert_eq!(v.user.username, "alice");
        assert_eq!(v.exp, t0 + SESSION_TTL_MS);
    }

    #[test]
    fn expiry_is_strict() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users.clone());
        let alice = users.find("alice").unwrap();

        let t0 = 1_700_000_000_000i64;
        let token = auth.issue_at(alice, t0);
        assert!(auth.verify_at(&token, t0 + SESSION_TTL_MS - 1).is_ok());
        assert!(auth.verify_at(&token, t0 + SESSION_TTL_MS).is_err());
    }

    #[test]
    fn any_bit_flip_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users.clone());
        let alice = users.find("alice").unwrap();
        let token = auth.issue_at(alice, 1_700_000_000_000);

        let mut chars: Vec<char> = token.chars().collect();
        for idx in [0, chars.len() / 2, chars.len() - 1] {
            let orig = chars[idx];
            chars[idx] = if orig == 'A' { 'B' } else { 'A' };
            let tampered: String = chars.iter().collect();
            if tampered != token {
                assert!(auth.verify_at(&tampered, 1_700_000_000_001).is_err(), "index {idx}");
            }
            chars[idx] = orig;
        }
    }

    #[test]
    fn wrong_secret_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users.clone());
        let other = SessionAuthority::new(b"different".to_vec(), users.clone());
        let alice = users.find("alice").unwrap();

        let token = auth.issue_at(alice, 1_700_000_000_000);
        assert!(other.verify_at(&token, 1_700_000_000_001).is_err());
    }

    #[test]
    fn structural_garbage_is_unauthorized() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users);
        for garbage in ["", ".", "a.b.c", "notbase64.!!!!", "e30", "e30."] {
            let err = auth.verify_at(garbage, 0).unwrap_err();
            assert_eq!(err.http_status(), 401, "{garbage:?}");
        }
    }

    #[test]
    fn rotation_window() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users.clone());
        let alice = users.find("alice").unwrap();

        let t0 = 1_700_000_000_000i64;
        let token = auth.issue_at(alice, t0);
        // 7h40m in: 20 minutes remain, under the 30 minute threshold.
        let late = t0 + SESSION_TTL_MS - 20 * 60 * 1000;
        let v = auth.verify_at(&token, late).unwrap();
        assert!(v.needs_rotation(late));

        // A fresh token issued at that moment stays valid well past the
        // original expiry.
        let rotated = auth.issue_at(&v.user, late);
        let much_later = t0 + SESSION_TTL_MS + 6 * 60 * 60 * 1000;
        assert!(auth.verify_at(&rotated, much_later).is_ok());

        // Early in the lifetime no rotation is due.
        let early = auth.verify_at(&token, t0 + 1000).unwrap();
        assert!(!early.needs_rotation(t0 + 1000));
    }

    #[test]
    fn login_failures_are_distinguished_internally() {
        let tmp = tempfile::tempdir().unwrap();
        let users = registry(&tmp);
        let auth = authority(users);
        assert_eq!(auth.check_login("nobody", "pw").unwrap_err(), LoginFailure::UserNotFound);
        assert_eq!(auth.check_login("alice", "wrong").unwrap_err(), LoginFailure::BadPassword);
        assert!(auth.check_login("alice", "pw").is_ok());
    }
}
