//! Directory-backed blob store.
//!
//! Blobs live under `root`, sharded by a prefix of their file name so a
//! single directory does not accumulate every blob:
//!
//! ```text
//! key "2010-01-01_foo.png"           -> root/2010/2010-01-01_foo.png        (shard_len 4)
//! key "original/fa1ee1d1b61d.jpg"    -> root/original/fa1e/fa1ee1d1b61d.jpg
//! ```
//!
//! The shard is taken from the part of the name before its first `.`.
//! Writes land in a hidden temp file next to the destination and are renamed
//! into place on commit, so readers never observe a partial blob.

use super::{BlobMeta, BlobReader, BlobSink, BlobStore};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Default number of name characters used for the shard directory.
pub const DEFAULT_SHARD_LEN: usize = 4;

const TEMP_PREFIX: &str = ".blobsync-";
const TEMP_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    shard_len: usize,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shard_len: DEFAULT_SHARD_LEN,
        }
    }

    /// Set the shard prefix length. Zero stores keys at their plain path.
    pub fn with_shard_len(mut self, shard_len: usize) -> Self {
        self.shard_len = shard_len;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of `key`.
    pub fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        validate_key(key)?;

        let (dir, name) = match key.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, key),
        };

        let mut path = self.root.clone();
        if let Some(dir) = dir {
            path.push(dir);
        }
        if self.shard_len > 0 {
            path.push(shard_for(name, self.shard_len));
        }
        path.push(name);
        Ok(path)
    }

    /// Map a path relative to the root back to its key, if it names a blob.
    fn key_for(&self, relative: &Path) -> Option<String> {
        let mut parts = Vec::new();
        for component in relative.components() {
            parts.push(component.as_os_str().to_str()?);
        }

        let name = *parts.last()?;
        if is_temp_name(name) {
            return None;
        }

        if self.shard_len == 0 {
            return Some(parts.join("/"));
        }

        if parts.len() < 2 || parts[parts.len() - 2] != shard_for(name, self.shard_len) {
            tracing::debug!("Ignoring unsharded file {}", relative.display());
            return None;
        }

        let dirs = &parts[..parts.len() - 2];
        if dirs.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{}/{}", dirs.join("/"), name))
        }
    }

    fn scan(&self) -> io::Result<Vec<BlobMeta>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let walker = ignore::WalkBuilder::new(&self.root)
            .standard_filters(false)
            .follow_links(false)
            .build();

        let mut blobs = Vec::new();
        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let Some(key) = self.key_for(relative) else {
                continue;
            };

            let size = entry.metadata().map_err(io::Error::other)?.len();
            blobs.push(BlobMeta::new(key, size));
        }

        blobs.sort();
        Ok(blobs)
    }
}

/// Reject keys that would not map to a path strictly below the root, or
/// that would not survive the path -> key round trip.
fn validate_key(key: &str) -> io::Result<()> {
    let invalid = |reason: &str| {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid blob key '{}': {}", key, reason),
        ))
    };

    if key.is_empty() {
        return invalid("empty key");
    }
    if key.contains('\\') || key.contains('\0') {
        return invalid("contains a reserved character");
    }
    for segment in key.split('/') {
        match segment {
            "" => return invalid("empty path segment"),
            "." | ".." => return invalid("relative path segment"),
            _ if is_temp_name(segment) => return invalid("reserved for in-progress writes"),
            _ => {}
        }
    }
    if Path::new(key).is_absolute() {
        return invalid("absolute path");
    }
    Ok(())
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

fn shard_for(name: &str, shard_len: usize) -> String {
    let stem = name.split('.').next().unwrap_or_default();
    let stem = if stem.is_empty() { name } else { stem };
    stem.chars().take(shard_len).collect()
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self) -> io::Result<Vec<BlobMeta>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.scan())
            .await
            .map_err(io::Error::other)?
    }

    async fn exists(&self, key: &str) -> io::Result<bool> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn open_read(&self, key: &str) -> io::Result<BlobReader> {
        let path = self.path_for(key)?;
        let file = File::open(&path).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, key: &str) -> io::Result<Box<dyn BlobSink>> {
        let dest = self.path_for(key)?;
        let dir = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).await?;

        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(TEMP_SUFFIX)
                .tempfile_in(dir)
        })
        .await
        .map_err(io::Error::other)??;
        let (file, temp) = temp.into_parts();

        Ok(Box::new(FsBlobSink {
            file: Some(File::from_std(file)),
            temp: Some(temp),
            dest,
        }))
    }
}

/// Sink writing into a temp file; the temp file is removed if the sink is
/// dropped before `commit`.
struct FsBlobSink {
    file: Option<File>,
    temp: Option<TempPath>,
    dest: PathBuf,
}

fn sink_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "blob sink already committed")
}

impl AsyncWrite for FsBlobSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_write(cx, data),
            None => Poll::Ready(Err(sink_closed())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    async fn commit(&mut self) -> io::Result<()> {
        let mut file = self.file.take().ok_or_else(sink_closed)?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let temp = self.temp.take().ok_or_else(sink_closed)?;
        let dest = self.dest.clone();
        tokio::task::spawn_blocking(move || temp.persist(&dest))
            .await
            .map_err(io::Error::other)?
            .map_err(|e| e.error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn put(store: &FsBlobStore, key: &str, content: &[u8]) {
        let mut sink = store.open_write(key).await.unwrap();
        sink.write_all(content).await.unwrap();
        sink.commit().await.unwrap();
    }

    #[test]
    fn test_sharded_paths() {
        let store = FsBlobStore::new("/data").with_shard_len(7);
        assert_eq!(
            store.path_for("2010-01-01_foo.png").unwrap(),
            PathBuf::from("/data/2010-01/2010-01-01_foo.png")
        );
        assert_eq!(
            store.path_for("foo.txt").unwrap(),
            PathBuf::from("/data/foo/foo.txt")
        );

        let store = FsBlobStore::new("/data");
        assert_eq!(
            store.path_for("original/fa1ee1d1.jpg").unwrap(),
            PathBuf::from("/data/original/fa1e/fa1ee1d1.jpg")
        );
    }

    #[test]
    fn test_unsharded_paths() {
        let store = FsBlobStore::new("/data").with_shard_len(0);
        assert_eq!(
            store.path_for("a/b.txt").unwrap(),
            PathBuf::from("/data/a/b.txt")
        );
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = FsBlobStore::new("/data");
        for key in ["", "../etc/passwd", "/abs", "a//b", "a/./b", "dir/"] {
            let err = store.path_for(key).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_rejects_temp_file_names() {
        let temp = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp.path());
        for key in [".blobsync-x.part", "dir/.blobsync-abc.part"] {
            let err = store.open_write(key).await.err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "key {:?}", key);
        }
        assert!(store.list().await.unwrap().is_empty());

        // Only the exact temp pattern is reserved.
        for key in [".blobsync-x", "blobsync-x.part", "notes.part"] {
            put(&store, key, b"kept").await;
        }
        let listed: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(listed.len(), 3);
        for key in [".blobsync-x", "blobsync-x.part", "notes.part"] {
            assert!(store.exists(key).await.unwrap());
            assert!(listed.iter().any(|k| k == key), "{} not listed", key);
        }
    }

    #[tokio::test]
    async fn test_missing_root_lists_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_list_read() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path()).with_shard_len(7);

        put(&store, "2010-01-01_foo.png", b"hello").await;
        put(&store, "original/abc.jpg", b"").await;

        assert!(tmp.path().join("2010-01/2010-01-01_foo.png").exists());
        assert!(store.exists("original/abc.jpg").await.unwrap());
        assert!(!store.exists("other.jpg").await.unwrap());

        let listing = store.list().await.unwrap();
        assert_eq!(
            listing,
            vec![
                BlobMeta::new("2010-01-01_foo.png", 5),
                BlobMeta::new("original/abc.jpg", 0),
            ]
        );

        let mut content = String::new();
        store
            .open_read("2010-01-01_foo.png")
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn test_dropped_sink_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path());

        let mut sink = store.open_write("partial.bin").await.unwrap();
        sink.write_all(b"half a blob").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        drop(sink);

        assert!(!store.exists("partial.bin").await.unwrap());
        let shard = tmp.path().join("part");
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stray_files_are_not_blobs() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("loose.txt"), "x").unwrap();
        let store = FsBlobStore::new(tmp.path());
        assert!(store.list().await.unwrap().is_empty());
    }
}
