//! User registry: loaded once at startup, immutable until restart.
//!
//! Users come from USERS_JSON / USERS_FILE (a JSON array) or from the
//! single-admin ADMIN_PASSWORD fallback. Each user's declared virtual root
//! is realized under FILE_ROOT and symlink-resolved; a root that escapes
//! FILE_ROOT is a startup error, not a runtime one.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "read-write")]
    ReadWrite,
    #[serde(rename = "admin")]
    Admin,
}

impl Role {
    pub fn can_write(self) -> bool {
        matches!(self, Role::ReadWrite | Role::Admin)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::ReadOnly => "read-only",
            Role::ReadWrite => "read-write",
            Role::Admin => "admin",
        }
    }
}

/// One row of the users file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSpec {
    username: String,
    role: Role,
    #[serde(default)]
    root_path: Option<String>,
    secret: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub role: Role,
    /// Declared virtual root (POSIX, absolute).
    pub root_path: String,
    /// Symlink-resolved host path of the root; all containment checks use it.
    pub root_real: PathBuf,
    secret: String,
}

impl User {
    /// Constant-time secret check. A `scrypt$<b64salt>$<b64hash>` secret is
    /// re-derived with the stored salt; anything else is compared as
    /// plaintext.
    pub fn verify_secret(&self, presented: &str) -> bool {
        if let Some(rest) = self.secret.strip_prefix("scrypt$") {
            return verify_scrypt(rest, presented);
        }
        bool::from(self.secret.as_bytes().ct_eq(presented.as_bytes()))
    }
}

fn verify_scrypt(salt_and_hash: &str, presented: &str) -> bool {
    use base64::Engine;
    let Some((salt_b64, hash_b64)) = salt_and_hash.split_once('$') else {
        return false;
    };
    let engine = base64::engine::general_purpose::STANDARD;
    let (Ok(salt), Ok(expected)) = (engine.decode(salt_b64), engine.decode(hash_b64)) else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    let Ok(params) = scrypt::Params::new(14, 8, 1, expected.len()) else {
        return false;
    };
    let mut derived = vec![0u8; expected.len()];
    if scrypt::scrypt(presented.as_bytes(), &salt, &params, &mut derived).is_err() {
        return false;
    }
    bool::from(derived.ct_eq(&expected))
}

/// Produce a `scrypt$<b64salt>$<b64hash>` tuple for a password. Used by
/// operators provisioning users files and by tests.
pub fn scrypt_secret(password: &str) -> Result<String> {
    use base64::Engine;
    let mut salt = [0u8; 16];
    getrandom::getrandom(&mut salt).context("generating scrypt salt")?;
    let params = scrypt::Params::new(14, 8, 1, 64).context("scrypt parameters")?;
    let mut hash = [0u8; 64];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut hash).context("deriving scrypt hash")?;
    let engine = base64::engine::general_purpose::STANDARD;
    Ok(format!("scrypt${}${}", engine.encode(salt), engine.encode(hash)))
}

pub struct UserRegistry {
    users: Vec<User>,
    /// Canonical FILE_ROOT every root_real must live under.
    pub file_root_real: PathBuf,
}

impl UserRegistry {
    pub fn load(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.file_root)
            .with_context(|| format!("creating FILE_ROOT {}", config.file_root.display()))?;
        let file_root_real = std::fs::canonicalize(&config.file_root)
            .with_context(|| format!("resolving FILE_ROOT {}", config.file_root.display()))?;

        let specs = load_specs(config)?;
        if specs.is_empty() {
            bail!("no users configured: set USERS_FILE, USERS_JSON, or ADMIN_PASSWORD");
        }

        let mut users = Vec::with_capacity(specs.len());
        for spec in specs {
            let declared = spec.root_path.as_deref().unwrap_or("/");
            let root_path = paths::normalize(declared)
                .map_err(|e| anyhow::anyhow!("user {}: bad rootPath {declared:?}: {e}", spec.username))?;
            let root_real = realize_root(&file_root_real, &root_path)
                .with_context(|| format!("user {}: realizing root {root_path}", spec.username))?;
            users.push(User {
                username: spec.username,
                role: spec.role,
                root_path,
                root_real,
                secret: spec.secret,
            });
        }
        Ok(UserRegistry { users, file_root_real })
    }

    pub fn find(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }
}

fn load_specs(config: &Config) -> Result<Vec<UserSpec>> {
    if let Some(json) = &config.users_json {
        return parse_specs(json).context("parsing USERS_JSON");
    }
    if let Some(path) = &config.users_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading USERS_FILE {}", path.display()))?;
        return parse_specs(&raw).with_context(|| format!("parsing USERS_FILE {}", path.display()));
    }
    if let Some(password) = &config.admin_password {
        return Ok(vec![UserSpec {
            username: "admin".to_string(),
            role: Role::Admin,
            root_path: None,
            secret: password.clone(),
        }]);
    }
    Ok(Vec::new())
}

fn parse_specs(raw: &str) -> Result<Vec<UserSpec>> {
    // Accept either a bare array or {"users": [...]}.
    #[derive(Deserialize)]
    struct Wrapper {
        users: Vec<UserSpec>,
    }
    if let Ok(w) = serde_json::from_str::<Wrapper>(raw) {
        return Ok(w.users);
    }
    Ok(serde_json::from_str::<Vec<UserSpec>>(raw)?)
}

fn realize_root(file_root_real: &Path, root_path: &str) -> Result<PathBuf> {
    let host = if root_path == "/" {
        file_root_real.to_path_buf()
    } else {
        file_root_real.join(&root_path[1..])
    };
    std::fs::create_dir_all(&host).with_context(|| format!("creating {}", host.display()))?;
    let real = std::fs::canonicalize(&host).with_context(|| format!("resolving {}", host.display()))?;
    if real != *file_root_real && !real.starts_with(file_root_real) {
        bail!("root {} escapes FILE_ROOT", real.display());
    }
    Ok(real)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_secret(secret: &str) -> User {
        User {
            username: "u".into(),
            role: Role::ReadWrite,
            root_path: "/".into(),
            root_real: PathBuf::from("/"),
            secret: secret.into(),
        }
    }

    #[test]
    fn plaintext_secret_roundtrip() {
        let u = user_with_secret("hunter2");
        assert!(u.verify_secret("hunter2"));
        assert!(!u.verify_secret("hunter3"));
        assert!(!u.verify_secret(""));
    }

    #[test]
    fn scrypt_secret_roundtrip() {
        let tuple = scrypt_secret("correct horse").unwrap();
        assert!(tuple.starts_with("scrypt$"));
        let u = user_with_secret(&tuple);
        assert!(u.verify_secret("correct horse"));
        assert!(!u.verify_secret("wrong horse"));
    }

    #[test]
    fn malformed_scrypt_tuples_fail_closed() {
        for bad in ["scrypt$", "scrypt$onlysalt", "scrypt$!!!$???", "scrypt$$"] {
            assert!(!user_with_secret(bad).verify_secret("anything"), "{bad}");
        }
    }

    #[test]
    fn role_capabilities() {
        assert!(!Role::ReadOnly.can_write());
        assert!(Role::ReadWrite.can_write());
        assert!(Role::Admin.can_write());
        assert!(Role::Admin.is_admin());
        assert!(!Role::ReadWrite.is_admin());
    }

    #[test]
    fn specs_parse_both_shapes() {
        let bare = r#"[{"username":"a","role":"admin","secret":"x"}]"#;
        let wrapped = r#"{"users":[{"username":"b","role":"read-only","rootPath":"/b","secret":"y"}]}"#;
        assert_eq!(parse_specs(bare).unwrap().len(), 1);
        let w = parse_specs(wrapped).unwrap();
        assert_eq!(w[0].root_path.as_deref(), Some("/b"));
        assert_eq!(w[0].role, Role::ReadOnly);
    }

    #[test]
    fn registry_scopes_roots_under_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            file_root: tmp.path().to_path_buf(),
            session_secret: b"k".to_vec(),
            admin_password: None,
            users_file: None,
            users_json: Some(
                r#"[{"username":"alice","role":"read-write","rootPath":"/alice","secret":"pw"}]"#.into(),
            ),
            archive_large_bytes: 1,
            search_max_bytes: 1,
            audit_log_path: tmp.path().join("audit.log"),
            max_s3_connections: 5,
            http_port: 0,
            data_dir: tmp.path().join("data"),
        };
        let reg = UserRegistry::load(&config).unwrap();
        let alice = reg.find("alice").unwrap();
        assert_eq!(alice.root_path, "/alice");
        assert!(alice.root_real.starts_with(&reg.file_root_real));
        assert!(alice.root_real.is_dir());
        assert!(reg.find("bob").is_none());
    }
}
