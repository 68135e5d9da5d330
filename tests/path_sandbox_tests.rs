//! Sandbox integration tests: traversal, symlink escape, and the
//! adapter-level invariants that every resolved host path stays under the
//! caller's root.

use anyhow::Result;
use tempfile::tempdir;

use filedepot::error::AppError;
use filedepot::paths::{normalize, resolve_safe};
use filedepot::storage::{LocalAdapter, StorageAdapter};

fn rooted(tmp: &tempfile::TempDir) -> std::path::PathBuf {
    std::fs::canonicalize(tmp.path()).unwrap()
}

#[test]
fn traversal_inputs_never_leave_the_root() -> Result<()> {
    let tmp = tempdir()?;
    let root = rooted(&tmp);
    std::fs::write(root.join("inside.txt"), b"ok")?;

    for hostile in [
        "/../etc",
        "/../../etc/passwd",
        "../../../root",
        "/a/../../..",
        "\\..\\..\\windows",
    ] {
        match resolve_safe(hostile, &root) {
            Ok(resolved) => {
                assert!(
                    resolved.host_path == root || resolved.host_path.starts_with(&root),
                    "{hostile} resolved to {:?}",
                    resolved.host_path
                );
            }
            Err(err) => {
                // Collapsed-then-missing paths surface as the generic 404.
                assert_eq!(err.public_message(), "Path not found.", "{hostile}");
            }
        }
    }
    Ok(())
}

#[test]
fn list_of_parent_traversal_is_a_plain_not_found() -> Result<()> {
    // Spec scenario: user root /data/u, request list path="/../etc" -> the
    // normalized path is /etc inside the sandbox, which does not exist.
    let tmp = tempdir()?;
    let root = rooted(&tmp);
    let err = resolve_safe("/../etc", &root).unwrap_err();
    assert_eq!(err.http_status(), 404);
    assert_eq!(err.public_message(), "Path not found.");
    Ok(())
}

#[cfg(unix)]
#[test]
fn symlink_escapes_are_reported_as_not_found() -> Result<()> {
    let tmp = tempdir()?;
    let root = rooted(&tmp);
    let outside = tempdir()?;
    std::fs::write(outside.path().join("secret.txt"), b"secret")?;
    std::os::unix::fs::symlink(outside.path(), root.join("sneaky"))?;

    let err = resolve_safe("/sneaky", &root).unwrap_err();
    assert!(matches!(err, AppError::Escape { .. }));
    assert_eq!(err.http_status(), 404);
    assert_eq!(err.public_message(), "Path not found.");

    let nested = resolve_safe("/sneaky/secret.txt", &root).unwrap_err();
    assert_eq!(nested.public_message(), "Path not found.");
    Ok(())
}

#[test]
fn normalize_always_yields_rooted_dotdot_free_paths() {
    let inputs = [
        "notes.txt",
        "/a/b/../c",
        "a//b///c",
        "\\mixed/style\\path",
        "/../up",
        "/trailing/",
        "/./x/./y",
    ];
    for input in inputs {
        let out = normalize(input).unwrap();
        assert!(out.starts_with('/'), "{input} -> {out}");
        assert!(!out.split('/').any(|seg| seg == ".."), "{input} -> {out}");
        if out != "/" {
            assert!(!out[1..].split('/').any(str::is_empty), "{input} -> {out}");
        }
    }
}

#[tokio::test]
async fn move_roundtrip_preserves_content() -> Result<()> {
    let tmp = tempdir()?;
    let fs = LocalAdapter::new(rooted(&tmp));
    fs.write("/a.txt", b"payload").await.unwrap();

    fs.rename("/a.txt", "/b.txt").await.unwrap();
    assert!(!fs.exists("/a.txt").await.unwrap());
    assert!(fs.exists("/b.txt").await.unwrap());

    fs.rename("/b.txt", "/a.txt").await.unwrap();
    assert!(fs.exists("/a.txt").await.unwrap());
    assert_eq!(fs.read("/a.txt").await.unwrap(), b"payload");
    Ok(())
}

#[tokio::test]
async fn move_into_itself_is_rejected() -> Result<()> {
    let tmp = tempdir()?;
    let fs = LocalAdapter::new(rooted(&tmp));
    fs.mkdir("/a").await.unwrap();
    let err = fs.rename("/a", "/a/b").await.unwrap_err();
    assert_eq!(err.http_status(), 400);
    Ok(())
}

#[tokio::test]
async fn sibling_prefix_names_are_distinct() -> Result<()> {
    // /data/foobar must never satisfy a containment check against
    // /data/foo.
    let tmp = tempdir()?;
    let base = rooted(&tmp);
    std::fs::create_dir_all(base.join("foo"))?;
    std::fs::create_dir_all(base.join("foobar"))?;
    std::fs::write(base.join("foobar/file.txt"), b"x")?;

    let scoped = LocalAdapter::new(base.join("foo"));
    assert!(!scoped.exists("/file.txt").await.unwrap());
    assert!(scoped.read("/file.txt").await.is_err());
    Ok(())
}
