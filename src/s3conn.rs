//! Per-session S3 connection registry.
//!
//! Process-local map from `(session, configId)` to a live adapter. The cap
//! bounds the number of *distinct* configs live across the whole process;
//! attaching to an already-live config never counts against it. Sessions
//! are stateless tokens, so the registry keys on the token nonce. Nothing
//! here is replicated: every node keeps its own map.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::s3config::S3ConfigProfile;
use crate::storage::S3Adapter;

pub struct S3ConnectionRegistry {
    max_connections: usize,
    inner: Mutex<HashMap<(String, String), Arc<S3Adapter>>>,
}

impl S3ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self { max_connections, inner: Mutex::new(HashMap::new()) }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Bind a session to a config. The cap check and the insert happen
    /// under one critical section so two racing attaches cannot both pass.
    pub fn attach(&self, session_id: &str, profile: &S3ConfigProfile) -> AppResult<Arc<S3Adapter>> {
        let mut map = self.inner.lock();
        let binding = (session_id.to_string(), profile.id.clone());
        if let Some(existing) = map.get(&binding) {
            return Ok(existing.clone());
        }
        // Reuse the live adapter when any session already holds this config.
        let live = map
            .iter()
            .find(|((_, cfg), _)| *cfg == profile.id)
            .map(|(_, adapter)| adapter.clone());
        let adapter = match live {
            Some(adapter) => adapter,
            None => {
                let distinct: HashSet<&str> = map.keys().map(|(_, cfg)| cfg.as_str()).collect();
                if distinct.len() >= self.max_connections {
                    return Err(AppError::at_limit(format!(
                        "S3 connection limit reached (max {}).",
                        self.max_connections
                    )));
                }
                Arc::new(S3Adapter::new(profile.clone())?)
            }
        };
        map.insert(binding, adapter.clone());
        Ok(adapter)
    }

    /// Drop one binding, or every binding of the session when no config is
    /// named.
    pub fn detach(&self, session_id: &str, config_id: Option<&str>) {
        let mut map = self.inner.lock();
        match config_id {
            Some(cfg) => {
                map.remove(&(session_id.to_string(), cfg.to_string()));
            }
            None => map.retain(|(sess, _), _| sess != session_id),
        }
    }

    /// Token rotation mints a new session id; carry the old session's
    /// bindings over so live connections survive the rotation.
    pub fn rekey_session(&self, old: &str, new: &str) {
        let mut map = self.inner.lock();
        let moved: Vec<(String, String)> = map
            .keys()
            .filter(|(sess, _)| sess == old)
            .cloned()
            .collect();
        for key in moved {
            if let Some(adapter) = map.remove(&key) {
                map.insert((new.to_string(), key.1), adapter);
            }
        }
    }

    /// Deleting a profile invalidates every session bound to it.
    pub fn on_profile_deleted(&self, config_id: &str) {
        self.inner.lock().retain(|(_, cfg), _| cfg != config_id);
    }

    pub fn resolve(&self, session_id: &str, config_id: &str) -> AppResult<Arc<S3Adapter>> {
        self.inner
            .lock()
            .get(&(session_id.to_string(), config_id.to_string()))
            .cloned()
            .ok_or_else(|| AppError::invalid_request("Not connected to this S3 configuration."))
    }

    /// Config ids this session is bound to.
    pub fn session_configs(&self, session_id: &str) -> Vec<String> {
        let map = self.inner.lock();
        let mut ids: Vec<String> = map
            .keys()
            .filter(|(sess, _)| sess == session_id)
            .map(|(_, cfg)| cfg.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn distinct_count(&self) -> usize {
        let map = self.inner.lock();
        map.keys().map(|(_, cfg)| cfg.as_str()).collect::<HashSet<_>>().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> S3ConfigProfile {
        S3ConfigProfile {
            id: id.to_string(),
            name: format!("profile-{id}"),
            region: "us-east-1".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
            access_key_id: "AK".to_string(),
            secret_access_key: "SK".to_string(),
            bucket: "bucket".to_string(),
            prefix: None,
            is_default: false,
        }
    }

    #[test]
    fn cap_counts_distinct_configs_only() {
        let reg = S3ConnectionRegistry::new(2);
        reg.attach("s1", &profile("a")).unwrap();
        reg.attach("s2", &profile("b")).unwrap();

        // Third distinct config hits the cap.
        let err = reg.attach("s3", &profile("c")).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(matches!(err, AppError::AtLimit { .. }));

        // An already-live config is reusable from a new session.
        reg.attach("s3", &profile("a")).unwrap();
        assert_eq!(reg.distinct_count(), 2);
        assert_eq!(reg.session_configs("s3"), vec!["a"]);
    }

    #[test]
    fn attach_is_idempotent_per_binding() {
        let reg = S3ConnectionRegistry::new(1);
        let first = reg.attach("s1", &profile("a")).unwrap();
        let second = reg.attach("s1", &profile("a")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.distinct_count(), 1);
    }

    #[test]
    fn detach_scopes() {
        let reg = S3ConnectionRegistry::new(5);
        reg.attach("s1", &profile("a")).unwrap();
        reg.attach("s1", &profile("b")).unwrap();
        reg.attach("s2", &profile("a")).unwrap();

        reg.detach("s1", Some("a"));
        assert_eq!(reg.session_configs("s1"), vec!["b"]);
        assert!(reg.resolve("s2", "a").is_ok());

        reg.detach("s1", None);
        assert!(reg.session_configs("s1").is_empty());
        assert_eq!(reg.distinct_count(), 1);
    }

    #[test]
    fn profile_deletion_severs_every_session() {
        let reg = S3ConnectionRegistry::new(5);
        reg.attach("s1", &profile("a")).unwrap();
        reg.attach("s2", &profile("a")).unwrap();
        reg.attach("s2", &profile("b")).unwrap();

        reg.on_profile_deleted("a");
        assert!(reg.resolve("s1", "a").is_err());
        assert!(reg.resolve("s2", "a").is_err());
        assert!(reg.resolve("s2", "b").is_ok());
        // Freed capacity is reusable.
        assert_eq!(reg.distinct_count(), 1);
    }

    #[test]
    fn rotation_rekeys_bindings() {
        let reg = S3ConnectionRegistry::new(5);
        reg.attach("old-nonce", &profile("a")).unwrap();
        reg.rekey_session("old-nonce", "new-nonce");
        assert!(reg.resolve("old-nonce", "a").is_err());
        assert!(reg.resolve("new-nonce", "a").is_ok());
        assert_eq!(reg.distinct_count(), 1);
    }

    #[test]
    fn resolve_without_attach_is_rejected() {
        let reg = S3ConnectionRegistry::new(5);
        let err = reg.resolve("s1", "a").unwrap_err();
        assert_eq!(err.http_status(), 400);
    }
}
