//! Persistent S3 profile store: one pretty-printed JSON document at
//! `data/settings.json`, mutated read-modify-write under a process-wide
//! lock and swapped into place atomically so concurrent admin edits cannot
//! lose each other.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3ConfigProfile {
    pub id: String,
    pub name: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl S3ConfigProfile {
    /// List-surface form: the secret never leaves through enumeration.
    pub fn redacted(&self) -> S3ConfigProfile {
        let mut clone = self.clone();
        clone.secret_access_key = String::new();
        clone
    }
}

/// Create/update payload: everything but the minted id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ConfigInput {
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsDoc {
    #[serde(default, rename = "s3Configs")]
    s3_configs: Vec<S3ConfigProfile>,
}

pub struct S3ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl S3ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, write_lock: Mutex::new(()) }
    }

    fn load(&self) -> AppResult<SettingsDoc> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| AppError::upstream(format!("settings.json is unreadable: {e}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SettingsDoc::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, doc: &SettingsDoc) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_vec_pretty(doc).map_err(|e| AppError::upstream(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn list(&self) -> AppResult<Vec<S3ConfigProfile>> {
        let _guard = self.write_lock.lock();
        Ok(self.load()?.s3_configs.iter().map(S3ConfigProfile::redacted).collect())
    }

    /// Full profile including the secret; only the admin settings flow
    /// calls this.
    pub fn get(&self, id: &str) -> AppResult<S3ConfigProfile> {
        let _guard = self.write_lock.lock();
        self.load()?
            .s3_configs
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::not_found("S3 configuration not found."))
    }

    pub fn create(&self, input: S3ConfigInput) -> AppResult<S3ConfigProfile> {
        let _guard = self.write_lock.lock();
        let mut doc = self.load()?;
        let profile = S3ConfigProfile {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            region: input.region,
            endpoint: input.endpoint,
            access_key_id: input.access_key_id,
            secret_access_key: input.secret_access_key,
            bucket: input.bucket,
            prefix: input.prefix,
            is_default: input.is_default,
        };
        doc.s3_configs.push(profile.clone());
        self.save(&doc)?;
        Ok(profile)
    }

    pub fn update(&self, id: &str, input: S3ConfigInput) -> AppResult<S3ConfigProfile> {
        let _guard = self.write_lock.lock();
        let mut doc = self.load()?;
        let slot = doc
            .s3_configs
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::not_found("S3 configuration not found."))?;
        slot.name = input.name;
        slot.region = input.region;
        slot.endpoint = input.endpoint;
        slot.access_key_id = input.access_key_id;
        // An empty secret on update keeps the stored one, so the settings
        // UI can round-trip a redacted listing.
        if !input.secret_access_key.is_empty() {
            slot.secret_access_key = input.secret_access_key;
        }
        slot.bucket = input.bucket;
        slot.prefix = input.prefix;
        slot.is_default = input.is_default;
        let updated = slot.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        let mut doc = self.load()?;
        let before = doc.s3_configs.len();
        doc.s3_configs.retain(|p| p.id != id);
        if doc.s3_configs.len() == before {
            return Err(AppError::not_found("S3 configuration not found."));
        }
        self.save(&doc)?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.load().map(|d| d.s3_configs.len()).unwrap_or(0)
    }
}
