//! Read-side view of the local adapter's trash sidecars.
//!
//! The adapter writes `<id>.json` records under `.trash/.meta/` as it moves
//! entries aside; this store lists them, hands restores back to the
//! adapter, and reconciles dangling sidecars at startup. The rename and the
//! sidecar write are not transactional, so a crash can leave a sidecar with
//! no physical item — reconciliation deletes those and leaves orphan
//! physical items untouched.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::storage::{EntryKind, LocalAdapter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashRecord {
    pub id: String,
    pub name: String,
    pub original_path: String,
    pub deleted_at: i64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub trash_name: String,
}

impl TrashRecord {
    fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.trash_name.is_empty() && !self.original_path.is_empty()
    }
}

pub struct TrashStore<'a> {
    adapter: &'a LocalAdapter,
}

impl<'a> TrashStore<'a> {
    pub fn new(adapter: &'a LocalAdapter) -> Self {
        Self { adapter }
    }

    /// All restorable records, newest deletion first. Unparseable or
    /// incomplete sidecars are skipped, not treated as errors.
    pub async fn list(&self) -> AppResult<Vec<TrashRecord>> {
        let meta_dir = self.adapter.meta_dir();
        let mut records = Vec::new();
        let mut rd = match tokio::fs::read_dir(&meta_dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") {
                continue;
            }
            let raw = match tokio::fs::read(entry.path()).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_slice::<TrashRecord>(&raw) {
                Ok(record) if record.is_complete() => records.push(record),
                Ok(_) => warn!("skipping incomplete trash sidecar {name}"),
                Err(err) => warn!("skipping unreadable trash sidecar {name}: {err}"),
            }
        }
        records.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> AppResult<TrashRecord> {
        let sidecar = self.adapter.meta_dir().join(format!("{id}.json"));
        let raw = tokio::fs::read(&sidecar)
            .await
            .map_err(|_| AppError::not_found("Trash item not found."))?;
        let record: TrashRecord = serde_json::from_slice(&raw)
            .map_err(|_| AppError::not_found("Trash item not found."))?;
        if !record.is_complete() {
            return Err(AppError::not_found("Trash item not found."));
        }
        Ok(record)
    }

    /// Restore by id and unlink the sidecar on success.
    pub async fn consume(&self, id: &str) -> AppResult<TrashRecord> {
        let record = self.get(id).await?;
        self.adapter.restore(&record).await?;
        let sidecar = self.adapter.meta_dir().join(format!("{id}.json"));
        if let Err(err) = tokio::fs::remove_file(&sidecar).await {
            warn!("restored {} but could not unlink its sidecar: {err}", record.id);
        }
        Ok(record)
    }

    /// Startup pass: drop sidecars whose physical item is gone. Returns the
    /// number removed.
    pub async fn reconcile(&self) -> AppResult<usize> {
        let mut removed = 0usize;
        for record in self.list().await? {
            let item = self.adapter.trash_dir().join(&record.trash_name);
            if item.symlink_metadata().is_err() {
                let sidecar = self.adapter.meta_dir().join(format!("{}.json", record.id));
                if tokio::fs::remove_file(&sidecar).await.is_ok() {
                    info!("reconcile: dropped dangling trash sidecar {}", record.id);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageAdapter;

    fn adapter() -> (tempfile::TempDir, LocalAdapter) {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        (tmp, LocalAdapter::new(root))
    }

    #[tokio::test]
    async fn empty_trash_lists_nothing() {
        let (_tmp, fs) = adapter();
        let store = TrashStore::new(&fs);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_roundtrip_via_store() {
        let (_tmp, fs) = adapter();
        fs.write("/notes.txt", b"hello").await.unwrap();
        let record = fs.trash("/notes.txt").await.unwrap();

        let store = TrashStore::new(&fs);
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "notes.txt");
        assert_eq!(listed[0].original_path, "/notes.txt");

        store.consume(&record.id).await.unwrap();
        assert_eq!(fs.read("/notes.txt").await.unwrap(), b"hello");
        assert!(store.list().await.unwrap().is_empty());
        // Physical trash dir no longer holds the item either.
        assert!(!fs.trash_dir().join(&record.trash_name).exists());
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let (_tmp, fs) = adapter();
        fs.write("/a.txt", b"a").await.unwrap();
        fs.write("/b.txt", b"b").await.unwrap();
        let first = fs.trash("/a.txt").await.unwrap();
        let second = fs.trash("/b.txt").await.unwrap();

        let store = TrashStore::new(&fs);
        let mut listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].deleted_at >= listed[1].deleted_at);
        // Tie on the same millisecond is fine; both ids must be present.
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        let mut expect = vec![first.id, second.id];
        expect.sort();
        let got: Vec<String> = listed.into_iter().map(|r| r.id).collect();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn malformed_sidecars_are_skipped() {
        let (_tmp, fs) = adapter();
        fs.write("/keep.txt", b"k").await.unwrap();
        fs.trash("/keep.txt").await.unwrap();
        std::fs::write(fs.meta_dir().join("broken.json"), b"not json").unwrap();
        std::fs::write(
            fs.meta_dir().join("incomplete.json"),
            br#"{"id":"","name":"x","originalPath":"","deletedAt":1,"type":"file","size":0,"trashName":""}"#,
        )
        .unwrap();

        let store = TrashStore::new(&fs);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_drops_dangling_sidecars() {
        let (_tmp, fs) = adapter();
        fs.write("/gone.txt", b"g").await.unwrap();
        fs.write("/stays.txt", b"s").await.unwrap();
        let gone = fs.trash("/gone.txt").await.unwrap();
        fs.trash("/stays.txt").await.unwrap();
        std::fs::remove_file(fs.trash_dir().join(&gone.trash_name)).unwrap();

        let store = TrashStore::new(&fs);
        assert_eq!(store.reconcile().await.unwrap(), 1);
        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "stays.txt");
    }

    #[tokio::test]
    async fn consume_unknown_id_is_not_found() {
        let (_tmp, fs) = adapter();
        let store = TrashStore::new(&fs);
        let err = store.consume("no-such-id").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
