//! Storage abstraction: one uniform surface over virtual paths, backed by
//! either the sandboxed local filesystem or an S3-compatible bucket.
//! Callers never branch on which adapter they hold.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

pub mod local;
pub mod s3;

pub use local::LocalAdapter;
pub use s3::S3Adapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

/// One directory member. `name` is a bare leaf; `size` is 0 for
/// directories; `mtime` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
}

/// One page of a listing plus the unpaginated count.
#[derive(Debug, Clone, Serialize)]
pub struct ListPage {
    pub entries: Vec<Entry>,
    pub total: usize,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn list(&self, path: &str, limit: Option<usize>, offset: usize) -> AppResult<ListPage>;
    async fn stat(&self, path: &str) -> AppResult<Option<Entry>>;
    async fn read(&self, path: &str) -> AppResult<Vec<u8>>;
    async fn write(&self, path: &str, bytes: &[u8]) -> AppResult<()>;
    /// Recursive for directories. The local adapter soft-deletes into the
    /// trash; S3 deletes outright.
    async fn delete(&self, path: &str) -> AppResult<()>;
    async fn rename(&self, from: &str, to: &str) -> AppResult<()>;
    async fn copy(&self, from: &str, to: &str) -> AppResult<()>;
    async fn mkdir(&self, path: &str) -> AppResult<()>;
    async fn exists(&self, path: &str) -> AppResult<bool>;
}

/// Directories first, then files, each group in case-insensitive name order.
pub fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        let rank = |e: &Entry| match e.kind {
            EntryKind::Dir => 0u8,
            EntryKind::File => 1u8,
        };
        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Apply offset then limit over a sorted entry set, keeping the
/// pre-slice count as `total`.
pub fn paginate(mut entries: Vec<Entry>, limit: Option<usize>, offset: usize) -> ListPage {
    sort_entries(&mut entries);
    let total = entries.len();
    let entries: Vec<Entry> = entries
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    ListPage { entries, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind) -> Entry {
        Entry { name: name.to_string(), kind, size: 0, mtime: 0 }
    }

    #[test]
    fn dirs_sort_before_files_case_insensitive() {
        let mut entries = vec![
            entry("zeta.txt", EntryKind::File),
            entry("Alpha", EntryKind::Dir),
            entry("beta.txt", EntryKind::File),
            entry("gamma", EntryKind::Dir),
            entry("Beta.txt", EntryKind::File),
        ];
        sort_entries(&mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "gamma", "Beta.txt", "beta.txt", "zeta.txt"]);
    }

    #[test]
    fn pagination_keeps_total() {
        let entries: Vec<Entry> = (0..10)
            .map(|i| entry(&format!("f{i:02}.txt"), EntryKind::File))
            .collect();
        let page = paginate(entries.clone(), Some(3), 4);
        assert_eq!(page.total, 10);
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["f04.txt", "f05.txt", "f06.txt"]);

        let all = paginate(entries, None, 0);
        assert_eq!(all.entries.len(), 10);
        assert_eq!(all.total, 10);
    }

    #[test]
    fn entry_serializes_with_type_field() {
        let e = entry("docs", EntryKind::Dir);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "dir");
        assert_eq!(v["name"], "docs");
    }
}
