//! Virtual path handling: normalization, sandbox-checked resolution, and
//! destination (not-yet-existing) resolution against a user's real root.
//!
//! Virtual paths are POSIX-form and always absolute; `/` is the caller's
//! scoped root, never the host's. Every host access goes through
//! `resolve_safe` or `resolve_destination`, which canonicalize and verify
//! containment so symlinked or traversal-crafted paths cannot leave the
//! root.

use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Reserved directory at the adapter root; never addressable by callers.
pub const TRASH_DIR: &str = ".trash";

/// A resolved virtual path and the host path backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub normalized: String,
    pub host_path: PathBuf,
}

/// Normalize a caller-supplied path into canonical virtual form.
/// Backslashes become slashes, a leading `/` is ensured, and `.`/`..`/empty
/// segments are collapsed. `..` at the root is dropped rather than escaping.
pub fn normalize(input: &str) -> AppResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_path("Path must not be empty."));
    }
    if trimmed.contains('\u{0000}') {
        return Err(AppError::invalid_path("Path must not contain NUL."));
    }
    let unified = trimmed.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// True for `/.trash` and anything nested under it.
pub fn is_trash_path(normalized: &str) -> bool {
    let reserved = format!("/{TRASH_DIR}");
    normalized == reserved || normalized.starts_with(&format!("{reserved}/"))
}

/// Validate a single path leaf: non-empty, no separators, no NUL, not a dot
/// segment. Returns the leaf unchanged.
pub fn sanitize_leaf(name: &str) -> AppResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::invalid_path("Name must not be empty."));
    }
    if name == "." || name == ".." {
        return Err(AppError::invalid_path("Name must not be a dot segment."));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\u{0000}') {
        return Err(AppError::invalid_path("Name must not contain path separators."));
    }
    Ok(name)
}

/// The virtual parent of a normalized path (`/` is its own parent).
pub fn virtual_parent(normalized: &str) -> String {
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// The leaf name of a normalized path; empty for `/`.
pub fn basename(normalized: &str) -> &str {
    normalized.rsplit('/').next().unwrap_or("")
}

/// Resolve a virtual path that must already exist on the host.
///
/// The joined path is canonicalized and the result must equal `root_real`
/// or sit under it. `Path::starts_with` compares component-wise, so
/// `/data/foobar` never passes a check against `/data/foo`.
pub fn resolve_safe(virtual_path: &str, root_real: &Path) -> AppResult<Resolved> {
    let normalized = normalize(virtual_path)?;
    if is_trash_path(&normalized) {
        return Err(AppError::invalid_path("Reserved path."));
    }
    let joined = if normalized == "/" {
        root_real.to_path_buf()
    } else {
        root_real.join(&normalized[1..])
    };
    let host_path = std::fs::canonicalize(&joined).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => AppError::not_found("Path not found."),
        _ => AppError::upstream(err.to_string()),
    })?;
    if host_path != root_real && !host_path.starts_with(root_real) {
        return Err(AppError::escape(format!(
            "{} resolved outside the caller root",
            normalized
        )));
    }
    Ok(Resolved { normalized, host_path })
}

/// Resolve a virtual path that may not exist yet: the parent must resolve
/// safely, the leaf must be a valid name. The root itself and anything under
/// `/.trash` are never valid destinations.
pub fn resolve_destination(virtual_path: &str, root_real: &Path) -> AppResult<Resolved> {
    let normalized = normalize(virtual_path)?;
    if normalized == "/" {
        return Err(AppError::invalid_path("The root is not a valid destination."));
    }
    if is_trash_path(&normalized) {
        return Err(AppError::invalid_path("Reserved path."));
    }
    let parent = virtual_parent(&normalized);
    let leaf = sanitize_leaf(basename(&normalized))?;
    let parent_resolved = resolve_safe(&parent, root_real)?;
    let host_path = parent_resolved.host_path.join(leaf);
    let normalized = if parent_resolved.normalized == "/" {
        format!("/{leaf}")
    } else {
        format!("{}/{leaf}", parent_resolved.normalized)
    };
    Ok(Resolved { normalized, host_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_segments() {
        assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("a//b/./c/").unwrap(), "/a/b/c");
        assert_eq!(normalize("\\win\\style").unwrap(), "/win/style");
        assert_eq!(normalize("/../..").unwrap(), "/");
        assert_eq!(normalize("/../etc").unwrap(), "/etc");
        assert_eq!(normalize("/").unwrap(), "/");
    }

    #[test]
    fn normalize_rejects_empty_and_nul() {
        assert!(normalize("").is_err());
        assert!(normalize("   ").is_err());
        assert!(normalize("/a\u{0000}b").is_err());
    }

    #[test]
    fn normalized_form_invariants() {
        for input in ["/x/../../y", "..\\..\\z", "a/b/c/..", "////", "/. /f"] {
            if let Ok(out) = normalize(input) {
                assert!(out.starts_with('/'), "{out}");
                assert!(!out.contains(".."), "{out}");
                assert!(!out[1..].split('/').any(|s| s.is_empty() && out != "/"), "{out}");
            }
        }
    }

    #[test]
    fn trash_paths_are_reserved() {
        assert!(is_trash_path("/.trash"));
        assert!(is_trash_path("/.trash/anything"));
        assert!(!is_trash_path("/.trashcan"));
        assert!(!is_trash_path("/a/.trash"));
    }

    #[test]
    fn leaf_sanitization() {
        assert_eq!(sanitize_leaf("notes.txt").unwrap(), "notes.txt");
        assert!(sanitize_leaf("").is_err());
        assert!(sanitize_leaf(".").is_err());
        assert!(sanitize_leaf("..").is_err());
        assert!(sanitize_leaf("a/b").is_err());
        assert!(sanitize_leaf("a\\b").is_err());
        assert!(sanitize_leaf("a\u{0000}").is_err());
    }

    #[test]
    fn parents_and_basenames() {
        assert_eq!(virtual_parent("/a/b/c"), "/a/b");
        assert_eq!(virtual_parent("/a"), "/");
        assert_eq!(virtual_parent("/"), "/");
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn resolve_safe_contains_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        std::fs::create_dir(root.join("inner")).unwrap();
        std::fs::write(root.join("inner/file.txt"), b"x").unwrap();

        let ok = resolve_safe("/inner/file.txt", &root).unwrap();
        assert_eq!(ok.normalized, "/inner/file.txt");
        assert_eq!(ok.host_path, root.join("inner/file.txt"));

        let root_res = resolve_safe("/", &root).unwrap();
        assert_eq!(root_res.host_path, root);

        // Traversal collapses back inside the root, then fails as missing.
        let missing = resolve_safe("/../../etc/passwd", &root).unwrap_err();
        assert_eq!(missing.http_status(), 404);

        assert!(resolve_safe("/.trash", &root).is_err());
        assert!(resolve_safe("/.trash/x", &root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_safe_rejects_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("leak")).unwrap();

        let err = resolve_safe("/leak", &root).unwrap_err();
        assert!(matches!(err, AppError::Escape { .. }));
        assert_eq!(err.public_message(), "Path not found.");
    }

    #[test]
    fn prefix_names_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(tmp.path()).unwrap();
        let root = base.join("data/foo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(base.join("data/foobar")).unwrap();
        std::fs::write(base.join("data/foobar/secret.txt"), b"s").unwrap();

        // A sibling whose name shares the root as a string prefix must not
        // satisfy the containment check.
        assert!(!base.join("data/foobar").starts_with(&root));
        assert!(resolve_safe("/secret.txt", &root).is_err());
    }

    #[test]
    fn resolve_destination_requires_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        std::fs::create_dir(root.join("docs")).unwrap();

        let dest = resolve_destination("/docs/new.txt", &root).unwrap();
        assert_eq!(dest.normalized, "/docs/new.txt");
        assert_eq!(dest.host_path, root.join("docs/new.txt"));

        assert!(resolve_destination("/missing/new.txt", &root).is_err());
        assert!(resolve_destination("/", &root).is_err());
        assert!(resolve_destination("/.trash/x", &root).is_err());
    }
}
