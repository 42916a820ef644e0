//! Content-addressed file cache. Entries are named by content hash and written once.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mirror_core::integrity::ContentHasher;
use mirror_core::ContentHash;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Download scratch files live here, outside the entry namespace.
const PARTIAL_DIR: &str = ".partial";
const COPY_STEP: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache directory unavailable: {0}")]
    Unavailable(PathBuf),
    #[error("cache io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    valid: bool,
    scratch: AtomicU64,
}

impl ContentCache {
    /// Open (creating if needed) the cache at `root`. A directory that cannot be created
    /// leaves the cache unavailable rather than failing.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let valid = match std::fs::create_dir_all(root.join(PARTIAL_DIR)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(dir = %root.display(), "cache unavailable: {}", e);
                false
            }
        };
        Self {
            root,
            valid,
            scratch: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.root.is_dir()
    }

    /// Path of the entry for `hash`. It may not exist yet.
    pub fn get(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.get(hash).is_file()
    }

    /// Scratch path for an in-flight download of `hash`. `tag` keeps concurrent downloads apart.
    pub fn partial_path(&self, hash: &ContentHash, tag: &str) -> PathBuf {
        self.root
            .join(PARTIAL_DIR)
            .join(format!("{}.{}", hash.as_str(), tag))
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CacheError::Unavailable(self.root.clone()))
        }
    }

    /// Store `bytes` under `hash`. Returns false, without writing, if the entry exists.
    pub async fn put(&self, hash: &ContentHash, bytes: &[u8]) -> Result<bool, CacheError> {
        self.check()?;
        if self.contains(hash) {
            return Ok(false);
        }
        let partial = self.partial_path(hash, &self.next_tag("put"));
        let mut f = File::create(&partial).await?;
        let written = async {
            f.write_all(bytes).await?;
            f.sync_all().await
        }
        .await;
        drop(f);
        if let Err(e) = written {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        self.commit(&partial, hash).await
    }

    /// Move a finished partial file into place as the entry for `hash`. If the entry already
    /// exists the partial is discarded and false is returned.
    pub async fn commit(&self, partial: &Path, hash: &ContentHash) -> Result<bool, CacheError> {
        self.check()?;
        let target = self.get(hash);
        // A hard link fails if the target exists, so two racing commits cannot both win.
        let placed = match fs::hard_link(partial, &target).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => false,
            Err(e) => {
                tracing::debug!("hard link failed, renaming: {}", e);
                if fs::try_exists(&target).await? {
                    false
                } else {
                    fs::rename(partial, &target).await?;
                    return Ok(true);
                }
            }
        };
        let _ = fs::remove_file(partial).await;
        if placed {
            tracing::debug!(hash = hash.as_str(), "cached");
        }
        Ok(placed)
    }

    /// Hash a local file and store it. Returns its hash and size.
    pub async fn import(&self, path: &Path) -> Result<(ContentHash, u64), CacheError> {
        self.check()?;
        let mut src = File::open(path).await?;
        let partial = self.root.join(PARTIAL_DIR).join(self.next_tag("import"));
        let copied = copy_hashing(&mut src, &partial).await;
        let (hash, size) = match copied {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        self.commit(&partial, &hash).await?;
        Ok((hash, size))
    }

    /// Entry count and total bytes. Scratch files are not counted.
    pub async fn usage(&self) -> Result<CacheUsage, CacheError> {
        self.check()?;
        let mut usage = CacheUsage::default();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                usage.files += 1;
                usage.bytes += meta.len();
            }
        }
        Ok(usage)
    }

    /// Delete every entry. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        self.check()?;
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        tracing::info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Open the entry for reading with its length. None if the cache is unavailable or the
    /// entry does not exist. Other open errors (a writer holding the file) are retried.
    pub async fn open_shared(
        &self,
        hash: &ContentHash,
        retries: u32,
        delay: Duration,
    ) -> Result<Option<(File, u64)>, CacheError> {
        if !self.is_valid() {
            return Ok(None);
        }
        let path = self.get(hash);
        let mut attempt = 0;
        loop {
            match File::open(&path).await {
                Ok(f) => {
                    let len = f.metadata().await?.len();
                    return Ok(Some((f, len)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    tracing::debug!(hash = hash.as_str(), attempt, "open failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn next_tag(&self, prefix: &str) -> String {
        let n = self.scratch.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", prefix, std::process::id(), n)
    }
}

async fn copy_hashing(src: &mut File, dest: &Path) -> io::Result<(ContentHash, u64)> {
    let mut out = File::create(dest).await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; COPY_STEP];
    let mut size = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    out.sync_all().await?;
    Ok((hasher.finish(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::integrity::hash_bytes;

    #[tokio::test]
    async fn put_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path());
        let h = hash_bytes(b"first");
        assert!(cache.put(&h, b"first").await.unwrap());
        assert!(!cache.put(&h, b"other").await.unwrap());
        assert_eq!(std::fs::read(cache.get(&h)).unwrap(), b"first");
    }

    #[tokio::test]
    async fn unavailable_directory_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let cache = ContentCache::open(blocker.join("cache"));
        assert!(!cache.is_valid());
        let h = hash_bytes(b"x");
        assert!(matches!(
            cache.put(&h, b"x").await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache
            .open_shared(&h, 0, Duration::ZERO)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn usage_and_clear_skip_partials() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path());
        cache.put(&hash_bytes(b"a"), b"a").await.unwrap();
        cache.put(&hash_bytes(b"bcd"), b"bcd").await.unwrap();
        std::fs::write(cache.partial_path(&hash_bytes(b"z"), "dl"), b"zz").unwrap();
        assert_eq!(
            cache.usage().await.unwrap(),
            CacheUsage { files: 2, bytes: 4 }
        );
        assert_eq!(cache.clear().await.unwrap(), 2);
        assert_eq!(cache.usage().await.unwrap(), CacheUsage::default());
        assert!(cache.is_valid());
    }

    #[tokio::test]
    async fn import_hashes_and_stores() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        std::fs::write(&src, b"test").unwrap();
        let cache = ContentCache::open(dir.path().join("cache"));
        let (hash, size) = cache.import(&src).await.unwrap();
        assert_eq!(
            hash.as_str(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert_eq!(size, 4);
        assert!(cache.contains(&hash));
    }

    #[tokio::test]
    async fn commit_discards_partial_when_entry_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path());
        let h = hash_bytes(b"data");
        let p1 = cache.partial_path(&h, "one");
        std::fs::write(&p1, b"data").unwrap();
        assert!(cache.commit(&p1, &h).await.unwrap());
        let p2 = cache.partial_path(&h, "two");
        std::fs::write(&p2, b"junk").unwrap();
        assert!(!cache.commit(&p2, &h).await.unwrap());
        assert!(!p2.exists());
        assert_eq!(std::fs::read(cache.get(&h)).unwrap(), b"data");
    }

    #[tokio::test]
    async fn open_shared_reports_missing_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path());
        let h = hash_bytes(b"hello");
        assert!(cache
            .open_shared(&h, 3, Duration::from_millis(1))
            .await
            .unwrap()
            .is_none());
        cache.put(&h, b"hello").await.unwrap();
        let (_, len) = cache
            .open_shared(&h, 3, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 5);
    }
}
