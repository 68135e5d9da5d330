//! Filesystem-backed adapter, scoped to one user's real root.
//!
//! Every operation resolves its virtual path against `root_real` before
//! touching the host. Symbolic links are never traversed: listings skip
//! them, recursive copies skip them, and resolution rejects anything whose
//! realpath leaves the root. Logical delete is a move into `.trash/` with a
//! JSON sidecar recording how to restore it.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::paths::{self, Resolved, TRASH_DIR};
use crate::policy;
use crate::trash::TrashRecord;

use super::{paginate, Entry, EntryKind, ListPage, StorageAdapter};

pub struct LocalAdapter {
    root_real: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub name: String,
    pub matched: String,
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn entry_for(name: &str, meta: &std::fs::Metadata) -> Entry {
    let kind = if meta.is_dir() { EntryKind::Dir } else { EntryKind::File };
    Entry {
        name: name.to_string(),
        kind,
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime: mtime_ms(meta),
    }
}

/// Keep trash filenames portable: anything outside [A-Za-z0-9._-] becomes
/// an underscore.
fn trash_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

impl LocalAdapter {
    pub fn new(root_real: PathBuf) -> Self {
        Self { root_real }
    }

    pub fn root_real(&self) -> &Path {
        &self.root_real
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root_real.join(TRASH_DIR)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.trash_dir().join(".meta")
    }

    fn resolve(&self, path: &str) -> AppResult<Resolved> {
        paths::resolve_safe(path, &self.root_real)
    }

    /// Destination resolution that creates missing intermediate directories.
    /// Existing components are canonicalized one step at a time so a symlink
    /// smuggled into the chain is still caught; newly created components
    /// cannot be symlinks.
    fn resolve_for_write(&self, path: &str) -> AppResult<Resolved> {
        match paths::resolve_destination(path, &self.root_real) {
            Err(AppError::NotFound { .. }) => {}
            other => return other,
        }
        let normalized = paths::normalize(path)?;
        if normalized == "/" || paths::is_trash_path(&normalized) {
            return Err(AppError::invalid_path("Reserved path."));
        }
        let segments: Vec<&str> = normalized[1..].split('/').collect();
        for seg in &segments {
            paths::sanitize_leaf(seg)?;
        }
        let mut virtual_acc = String::new();
        for seg in &segments[..segments.len() - 1] {
            virtual_acc.push('/');
            virtual_acc.push_str(seg);
            if let Err(AppError::NotFound { .. }) = self.resolve(&virtual_acc) {
                let parent = paths::virtual_parent(&virtual_acc);
                let parent_host = self.resolve(&parent)?.host_path;
                std::fs::create_dir(parent_host.join(seg))?;
            }
            // Re-resolve so symlinked components fail containment here.
            self.resolve(&virtual_acc)?;
        }
        paths::resolve_destination(path, &self.root_real)
    }

    /// Shared guard for rename/copy: source must exist and not be the root,
    /// the destination leaf must be free, and the destination must not sit
    /// inside the source tree.
    fn guard_transfer(&self, from: &str, to: &str) -> AppResult<(Resolved, Resolved)> {
        let src = self.resolve(from)?;
        if src.normalized == "/" {
            return Err(AppError::invalid_path("The root cannot be moved or copied."));
        }
        let dest = paths::resolve_destination(to, &self.root_real)?;
        if dest.host_path.symlink_metadata().is_ok() {
            return Err(AppError::conflict("Destination already exists."));
        }
        if dest.host_path == src.host_path || dest.host_path.starts_with(&src.host_path) {
            return Err(AppError::invalid_path("Cannot move a directory into itself."));
        }
        Ok((src, dest))
    }

    /// Soft delete: rename the host node into `.trash/` and write the
    /// restore sidecar. The sidecar is written after the rename; if it
    /// cannot be written the rename is undone so no unrecorded item is
    /// left behind.
    pub async fn trash(&self, path: &str) -> AppResult<TrashRecord> {
        let src = self.resolve(path)?;
        if src.normalized == "/" {
            return Err(AppError::invalid_path("The root cannot be deleted."));
        }
        let meta = tokio::fs::symlink_metadata(&src.host_path).await?;
        let name = paths::basename(&src.normalized).to_string();
        let id = Uuid::new_v4().to_string();
        let deleted_at = chrono::Utc::now().timestamp_millis();
        let trash_name = format!("{deleted_at}-{}-{id}", trash_safe_name(&name));

        tokio::fs::create_dir_all(self.meta_dir()).await?;
        let trash_path = self.trash_dir().join(&trash_name);
        tokio::fs::rename(&src.host_path, &trash_path).await?;

        let record = TrashRecord {
            id: id.clone(),
            name,
            original_path: src.normalized.clone(),
            deleted_at,
            kind: if meta.is_dir() { EntryKind::Dir } else { EntryKind::File },
            size: if meta.is_dir() { 0 } else { meta.len() },
            trash_name,
        };
        let sidecar = self.meta_dir().join(format!("{id}.json"));
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| AppError::upstream(e.to_string()))?;
        if let Err(err) = tokio::fs::write(&sidecar, body).await {
            warn!("sidecar write failed, undoing trash move: {err}");
            let _ = tokio::fs::rename(&trash_path, &src.host_path).await;
            return Err(err.into());
        }
        Ok(record)
    }

    /// Move a trash item back to where it came from. The recorded parent
    /// must still resolve and the destination leaf must be free.
    pub async fn restore(&self, record: &TrashRecord) -> AppResult<()> {
        let parent = paths::virtual_parent(&record.original_path);
        let parent_resolved = self.resolve(&parent).map_err(|err| match err {
            AppError::NotFound { .. } => {
                AppError::not_found("The original location no longer exists.")
            }
            other => other,
        })?;
        let leaf = paths::sanitize_leaf(paths::basename(&record.original_path))?;
        let dest = parent_resolved.host_path.join(leaf);
        if dest.symlink_metadata().is_ok() {
            return Err(AppError::conflict("An entry already exists at the original location."));
        }
        let trash_path = self.trash_dir().join(&record.trash_name);
        if trash_path.symlink_metadata().is_err() {
            return Err(AppError::not_found("Trash item is missing."));
        }
        tokio::fs::rename(&trash_path, &dest).await?;
        Ok(())
    }

    /// Accumulate the recursive byte size of already-resolved host paths,
    /// short-circuiting once `limit` is reached. Symlinks contribute
    /// nothing.
    pub fn probe_size(&self, hosts: &[PathBuf], limit: u64) -> AppResult<u64> {
        let mut total: u64 = 0;
        let mut stack: Vec<PathBuf> = hosts.to_vec();
        while let Some(path) = stack.pop() {
            let meta = match path.symlink_metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_file() {
                total = total.saturating_add(meta.len());
                if total >= limit {
                    return Ok(total);
                }
            } else if meta.is_dir() {
                for child in std::fs::read_dir(&path)? {
                    stack.push(child?.path());
                }
            }
        }
        Ok(total)
    }

    /// Linear scan under `path`: case-insensitive name matches always
    /// report; file content is scanned up to `max_bytes` per file and
    /// binary content (NUL in the window) is skipped.
    pub fn search(&self, path: &str, query: &str, max_bytes: u64) -> AppResult<Vec<SearchHit>> {
        let base = self.resolve(path)?;
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Err(AppError::invalid_request("Search query must not be empty."));
        }
        let mut hits = Vec::new();
        let mut stack: Vec<(PathBuf, String)> = vec![(base.host_path.clone(), base.normalized.clone())];
        while let Some((dir, virt)) = stack.pop() {
            for child in std::fs::read_dir(&dir)? {
                let child = child?;
                let file_type = child.file_type()?;
                if file_type.is_symlink() {
                    continue;
                }
                let name = child.file_name().to_string_lossy().to_string();
                if virt == "/" && name == TRASH_DIR {
                    continue;
                }
                let child_virt = if virt == "/" { format!("/{name}") } else { format!("{virt}/{name}") };
                if name.to_lowercase().contains(&needle) {
                    hits.push(SearchHit {
                        path: child_virt.clone(),
                        name: name.clone(),
                        matched: "name".to_string(),
                    });
                }
                if file_type.is_dir() {
                    stack.push((child.path(), child_virt));
                } else if file_type.is_file() {
                    let meta = child.metadata()?;
                    if meta.len() > max_bytes {
                        continue;
                    }
                    let bytes = match std::fs::read(child.path()) {
                        Ok(b) => b,
                        Err(_) => continue,
                    };
                    if policy::looks_binary(&bytes) {
                        continue;
                    }
                    let haystack = String::from_utf8_lossy(&bytes).to_lowercase();
                    if haystack.contains(&needle) {
                        hits.push(SearchHit {
                            path: child_virt,
                            name,
                            matched: "content".to_string(),
                        });
                    }
                }
            }
        }
        hits.sort_by(|a, b| a.path.cmp(&b.path));
        hits.dedup_by(|a, b| a.path == b.path);
        Ok(hits)
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir(dest)?;
    for child in std::fs::read_dir(src)? {
        let child = child?;
        let file_type = child.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let target = dest.join(child.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&child.path(), &target)?;
        } else {
            std::fs::copy(child.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    async fn list(&self, path: &str, limit: Option<usize>, offset: usize) -> AppResult<ListPage> {
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved.host_path).await?;
        if !meta.is_dir() {
            return Err(AppError::invalid_request("Not a directory."));
        }
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&resolved.host_path).await?;
        while let Some(child) = rd.next_entry().await? {
            let file_type = child.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let name = child.file_name().to_string_lossy().to_string();
            if resolved.normalized == "/" && name == TRASH_DIR {
                continue;
            }
            let child_meta = match child.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(entry_for(&name, &child_meta));
        }
        Ok(paginate(entries, limit, offset))
    }

    async fn stat(&self, path: &str) -> AppResult<Option<Entry>> {
        let resolved = match self.resolve(path) {
            Ok(r) => r,
            Err(AppError::NotFound { .. }) => return Ok(None),
            Err(other) => return Err(other),
        };
        let meta = tokio::fs::metadata(&resolved.host_path).await?;
        let name = match paths::basename(&resolved.normalized) {
            "" => "/",
            n => n,
        };
        Ok(Some(entry_for(name, &meta)))
    }

    async fn read(&self, path: &str) -> AppResult<Vec<u8>> {
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved.host_path).await?;
        if !meta.is_file() {
            return Err(AppError::invalid_request("Not a file."));
        }
        Ok(tokio::fs::read(&resolved.host_path).await?)
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> AppResult<()> {
        let resolved = self.resolve_for_write(path)?;
        if let Ok(meta) = resolved.host_path.symlink_metadata() {
            if meta.is_dir() {
                return Err(AppError::conflict("A directory exists at the destination."));
            }
        }
        tokio::fs::write(&resolved.host_path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        self.trash(path).await.map(|_| ())
    }

    async fn rename(&self, from: &str, to: &str) -> AppResult<()> {
        let (src, dest) = self.guard_transfer(from, to)?;
        tokio::fs::rename(&src.host_path, &dest.host_path).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> AppResult<()> {
        let (src, dest) = self.guard_transfer(from, to)?;
        let meta = tokio::fs::symlink_metadata(&src.host_path).await?;
        if meta.is_dir() {
            copy_dir_recursive(&src.host_path, &dest.host_path)?;
        } else {
            tokio::fs::copy(&src.host_path, &dest.host_path).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> AppResult<()> {
        let resolved = paths::resolve_destination(path, &self.root_real)?;
        match resolved.host_path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(AppError::conflict("A file exists at the destination.")),
            Err(_) => {
                tokio::fs::create_dir(&resolved.host_path).await?;
                Ok(())
            }
        }
    }

    async fn exists(&self, path: &str) -> AppResult<bool> {
        match self.resolve(path) {
            Ok(_) => Ok(true),
            Err(AppError::NotFound { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (tempfile::TempDir, LocalAdapter) {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        (tmp, LocalAdapter::new(root))
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let (_tmp, fs) = adapter();
        fs.write("/a/b/notes.txt", b"hello").await.unwrap();
        assert_eq!(fs.read("/a/b/notes.txt").await.unwrap(), b"hello");
        let stat = fs.stat("/a/b/notes.txt").await.unwrap().unwrap();
        assert_eq!(stat.kind, EntryKind::File);
        assert_eq!(stat.size, 5);
        assert!(stat.mtime > 0);
    }

    #[tokio::test]
    async fn list_sorts_and_hides_trash() {
        let (_tmp, fs) = adapter();
        fs.write("/zebra.txt", b"z").await.unwrap();
        fs.write("/Apple.txt", b"a").await.unwrap();
        fs.mkdir("/sub").await.unwrap();
        fs.write("/keep.txt", b"k").await.unwrap();
        fs.trash("/keep.txt").await.unwrap();

        let page = fs.list("/", None, 0).await.unwrap();
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "Apple.txt", "zebra.txt"]);
        assert_eq!(page.total, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_skips_symlinks() {
        let (_tmp, fs) = adapter();
        fs.write("/real.txt", b"r").await.unwrap();
        std::os::unix::fs::symlink(fs.root_real().join("real.txt"), fs.root_real().join("link.txt"))
            .unwrap();
        let page = fs.list("/", None, 0).await.unwrap();
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["real.txt"]);
    }

    #[tokio::test]
    async fn rename_roundtrip() {
        let (_tmp, fs) = adapter();
        fs.write("/one.txt", b"1").await.unwrap();
        fs.rename("/one.txt", "/two.txt").await.unwrap();
        assert!(!fs.exists("/one.txt").await.unwrap());
        assert!(fs.exists("/two.txt").await.unwrap());
        fs.rename("/two.txt", "/one.txt").await.unwrap();
        assert_eq!(fs.read("/one.txt").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn transfer_guards() {
        let (_tmp, fs) = adapter();
        fs.mkdir("/dir").await.unwrap();
        fs.write("/file.txt", b"f").await.unwrap();
        fs.write("/other.txt", b"o").await.unwrap();

        let into_itself = fs.rename("/dir", "/dir/sub").await.unwrap_err();
        assert_eq!(into_itself.http_status(), 400);

        let conflict = fs.rename("/file.txt", "/other.txt").await.unwrap_err();
        assert_eq!(conflict.http_status(), 409);

        let copy_into_itself = fs.copy("/dir", "/dir/clone").await.unwrap_err();
        assert_eq!(copy_into_itself.http_status(), 400);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_recurses_and_skips_symlinks() {
        let (_tmp, fs) = adapter();
        fs.write("/tree/a.txt", b"a").await.unwrap();
        fs.write("/tree/deep/b.txt", b"b").await.unwrap();
        std::os::unix::fs::symlink("/etc", fs.root_real().join("tree/escape")).unwrap();

        fs.copy("/tree", "/copy").await.unwrap();
        assert_eq!(fs.read("/copy/a.txt").await.unwrap(), b"a");
        assert_eq!(fs.read("/copy/deep/b.txt").await.unwrap(), b"b");
        assert!(fs.root_real().join("copy").join("escape").symlink_metadata().is_err());
    }

    #[tokio::test]
    async fn trash_then_restore() {
        let (_tmp, fs) = adapter();
        fs.write("/notes.txt", b"hello").await.unwrap();
        let record = fs.trash("/notes.txt").await.unwrap();
        assert_eq!(record.name, "notes.txt");
        assert_eq!(record.original_path, "/notes.txt");
        assert!(!fs.exists("/notes.txt").await.unwrap());
        assert!(fs.trash_dir().join(&record.trash_name).exists());
        assert!(fs.meta_dir().join(format!("{}.json", record.id)).exists());

        fs.restore(&record).await.unwrap();
        assert_eq!(fs.read("/notes.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn restore_refuses_occupied_destination() {
        let (_tmp, fs) = adapter();
        fs.write("/doc.txt", b"v1").await.unwrap();
        let record = fs.trash("/doc.txt").await.unwrap();
        fs.write("/doc.txt", b"v2").await.unwrap();
        let err = fs.restore(&record).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn restore_requires_parent() {
        let (_tmp, fs) = adapter();
        fs.write("/dir/doc.txt", b"x").await.unwrap();
        let record = fs.trash("/dir/doc.txt").await.unwrap();
        fs.trash("/dir").await.unwrap();
        let err = fs.restore(&record).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn cannot_trash_root_or_trash() {
        let (_tmp, fs) = adapter();
        assert!(fs.trash("/").await.is_err());
        assert!(fs.trash("/.trash").await.is_err());
    }

    #[tokio::test]
    async fn probe_short_circuits_at_limit() {
        let (_tmp, fs) = adapter();
        fs.write("/big/a.bin", &[0u8; 600]).await.unwrap();
        fs.write("/big/b.bin", &[0u8; 600]).await.unwrap();
        let host = fs.root_real().join("big");

        let capped = fs.probe_size(&[host.clone()], 1000).unwrap();
        assert!(capped >= 1000);
        let exact = fs.probe_size(&[host.clone()], 1200).unwrap();
        assert!(exact >= 1200);
        let uncapped = fs.probe_size(&[host], u64::MAX).unwrap();
        assert_eq!(uncapped, 1200);
    }

    #[tokio::test]
    async fn search_names_and_content() {
        let (_tmp, fs) = adapter();
        fs.write("/needle.txt", b"plain").await.unwrap();
        fs.write("/notes/log.txt", b"found a needle here").await.unwrap();
        fs.write("/bin.dat", b"nee\0dle").await.unwrap();

        let hits = fs.search("/", "needle", 1024).unwrap();
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["/needle.txt", "/notes/log.txt"]);
    }

    #[tokio::test]
    async fn mkdir_is_idempotent() {
        let (_tmp, fs) = adapter();
        fs.mkdir("/dir").await.unwrap();
        fs.mkdir("/dir").await.unwrap();
        fs.write("/file.txt", b"f").await.unwrap();
        assert_eq!(fs.mkdir("/file.txt").await.unwrap_err().http_status(), 409);
    }
}
