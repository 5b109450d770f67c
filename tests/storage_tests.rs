//! Tests for the content-addressed image cache.
//!
//! Validates blob layout, publication, per-container links and the
//! per-hash population lock.

use cubexec::ImageCache;
use cubexec::storage::{file_hash, publish_file, remove_path};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn cache(dir: &TempDir) -> ImageCache {
    ImageCache::with_path(dir.path().join("images")).unwrap()
}

// =============================================================================
// Creation And Layout Tests
// =============================================================================

#[test]
fn test_cache_creation() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);

    assert!(cache.base_dir().exists(), "cache directory should be created");
    assert!(cache.base_dir().join("locks").is_dir(), "locks directory should be created");
}

#[test]
fn test_blob_path_is_sharded() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);

    let path = cache.blob_path(HELLO_SHA256);
    assert_eq!(path, cache.base_dir().join("2c").join(HELLO_SHA256));
    assert_eq!(
        cache.blob_path(&format!("sha256:{}", HELLO_SHA256)),
        path,
        "sha256: prefix should be ignored"
    );
}

#[test]
fn test_blob_path_rejects_traversal() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);

    let path = cache.blob_path("../../etc/passwd");
    assert!(path.starts_with(cache.base_dir()), "path should stay inside the cache");
}

// =============================================================================
// Publication Tests
// =============================================================================

#[test]
fn test_publish_moves_file_into_cache() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let src = dir.path().join("download");
    fs::write(&src, b"hello").unwrap();

    let blob = cache.publish(HELLO_SHA256, &src).unwrap();

    assert!(cache.has_blob(HELLO_SHA256));
    assert!(!src.exists(), "source should be moved");
    assert_eq!(fs::read(blob).unwrap(), b"hello");
}

#[test]
fn test_publish_keeps_existing_blob() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    fs::write(&first, b"hello").unwrap();
    fs::write(&second, b"other").unwrap();

    cache.publish(HELLO_SHA256, &first).unwrap();
    let blob = cache.publish(HELLO_SHA256, &second).unwrap();

    assert_eq!(fs::read(blob).unwrap(), b"hello", "existing blob should win");
    assert!(!second.exists(), "discarded source should be removed");
}

#[test]
fn test_list_blobs() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let src = dir.path().join("download");
    fs::write(&src, b"hello").unwrap();
    cache.publish(HELLO_SHA256, &src).unwrap();

    assert_eq!(cache.list_blobs().unwrap(), vec![HELLO_SHA256.to_string()]);

    cache.remove_blob(HELLO_SHA256).unwrap();
    assert!(cache.list_blobs().unwrap().is_empty());
}

// =============================================================================
// Link Tests
// =============================================================================

#[test]
fn test_link_points_at_blob() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let src = dir.path().join("download");
    fs::write(&src, b"hello").unwrap();
    cache.publish(HELLO_SHA256, &src).unwrap();

    let link = dir.path().join("containers/1/image/container_image");
    cache.link(HELLO_SHA256, &link).unwrap();

    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), cache.blob_path(HELLO_SHA256));
    assert_eq!(fs::read(&link).unwrap(), b"hello");
}

#[test]
fn test_link_replaces_stale_link() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let src = dir.path().join("download");
    fs::write(&src, b"hello").unwrap();
    cache.publish(HELLO_SHA256, &src).unwrap();

    let link = dir.path().join("container_image");
    std::os::unix::fs::symlink(dir.path().join("gone"), &link).unwrap();
    cache.link(HELLO_SHA256, &link).unwrap();

    assert_eq!(fs::read(&link).unwrap(), b"hello");
}

#[test]
fn test_link_missing_blob_fails() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);

    let result = cache.link(HELLO_SHA256, &dir.path().join("link"));
    assert!(result.is_err(), "linking a missing blob should fail");
}

// =============================================================================
// Lock Tests
// =============================================================================

#[tokio::test]
async fn test_lock_serializes_holders() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(cache(&dir));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let (cache, inside, max_inside) = (cache.clone(), inside.clone(), max_inside.clone());
        handles.push(tokio::spawn(async move {
            let _lock = cache.lock(HELLO_SHA256).await.unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1, "only one holder at a time");
}

// =============================================================================
// File Helper Tests
// =============================================================================

#[test]
fn test_file_hash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"hello").unwrap();

    assert_eq!(file_hash(&path).unwrap(), HELLO_SHA256);
}

#[test]
fn test_remove_path_handles_everything() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("file");
    let tree = dir.path().join("tree/nested");
    fs::write(&file, b"x").unwrap();
    fs::create_dir_all(&tree).unwrap();

    remove_path(&file).unwrap();
    remove_path(&dir.path().join("tree")).unwrap();
    remove_path(&dir.path().join("missing")).unwrap();

    assert!(!file.exists());
    assert!(!tree.exists());
}

#[test]
fn test_publish_file_creates_parent() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("a/b/dst");
    fs::write(&src, b"data").unwrap();

    publish_file(&src, &dst).unwrap();

    assert!(!src.exists());
    assert_eq!(fs::read(&dst).unwrap(), b"data");
}
