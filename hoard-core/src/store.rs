//! On-disk content store: `{root}/{namespace}/{shard}/.../{full_key}`.
//!
//! One writer per key is assumed. Two concurrent writes to the same key
//! (e.g. the same file replicated by two peers at once) interleave on disk.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::cipher::{self, CipherError, IV_SIZE};
use crate::path::{cas_path, PathKey, PathTransform};

/// Root used when the configured storage root is empty.
pub const DEFAULT_ROOT: &str = "hoard_network";

const STAGING_SUFFIX: &str = "part";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("stream for {key} ended after {got} of {expected} bytes")]
    Short { key: String, expected: u64, got: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Sharded file store rooted at one directory, partitioned by namespace.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
    transform: PathTransform,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    /// Store using the content-address transform.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_transform(root, cas_path)
    }

    pub fn with_transform(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        let mut root = root.into();
        if root.as_os_str().is_empty() {
            root = PathBuf::from(DEFAULT_ROOT);
        }
        Self { root, transform }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.transform)(key)
    }

    /// Absolute location of `key`'s file.
    pub fn file_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(self.path_key(key).file())
    }

    pub async fn exists(&self, namespace: &str, key: &str) -> bool {
        fs::metadata(self.file_path(namespace, key)).await.is_ok()
    }

    /// Copy `src` verbatim into the key's file, replacing any previous content.
    pub async fn write<R>(&self, namespace: &str, key: &str, src: &mut R) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_plain(namespace, key, src, None).await
    }

    /// Like [`write`](Self::write), but takes exactly `size` bytes off `src`.
    /// A shorter stream leaves the previous content (or nothing) in place.
    pub async fn write_exact<R>(
        &self,
        namespace: &str,
        key: &str,
        src: &mut R,
        size: u64,
    ) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_plain(namespace, key, &mut src.take(size), Some(size))
            .await
    }

    /// Like [`write`](Self::write), but `src` is a sealed stream that gets
    /// decrypted on the way in. Returns plaintext bytes written.
    pub async fn write_decrypted<R>(
        &self,
        namespace: &str,
        key: &str,
        encryption_key: &[u8],
        src: &mut R,
    ) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_sealed(namespace, key, encryption_key, src, None)
            .await
    }

    /// Decrypt exactly `size` sealed bytes (IV included) off `src`.
    pub async fn write_decrypted_exact<R>(
        &self,
        namespace: &str,
        key: &str,
        encryption_key: &[u8],
        src: &mut R,
        size: u64,
    ) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let plain = size.saturating_sub(IV_SIZE as u64);
        self.write_sealed(namespace, key, encryption_key, &mut src.take(size), Some(plain))
            .await
    }

    async fn write_plain<R>(
        &self,
        namespace: &str,
        key: &str,
        src: &mut R,
        expected: Option<u64>,
    ) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut staged = self.stage(namespace, key).await?;
        let copied = tokio::io::copy(src, &mut staged.file).await.map_err(StoreError::from);
        staged.finish(key, copied, expected).await
    }

    async fn write_sealed<R>(
        &self,
        namespace: &str,
        key: &str,
        encryption_key: &[u8],
        src: &mut R,
        expected: Option<u64>,
    ) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut staged = self.stage(namespace, key).await?;
        let opened = cipher::decrypt_copy(encryption_key, src, &mut staged.file)
            .await
            .map_err(StoreError::from);
        staged.finish(key, opened, expected).await
    }

    /// Open the key's file. The caller owns the handle.
    pub async fn read(&self, namespace: &str, key: &str) -> StoreResult<(u64, File)> {
        let path = self.file_path(namespace, key);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Remove the whole first shard bucket holding `key`, along with every
    /// other key that hashes into the same bucket.
    pub async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        let pk = self.path_key(key);
        let Some(bucket) = pk.first_segment() else {
            return Ok(());
        };
        let dir = self.root.join(namespace).join(bucket);
        remove_dir_if_present(&dir).await?;
        debug!(key = %pk.full_key(), dir = %dir.display(), "deleted from disk");
        Ok(())
    }

    /// Remove the entire storage root, every namespace included.
    pub async fn clear(&self) -> StoreResult<()> {
        remove_dir_if_present(&self.root).await
    }

    async fn stage(&self, namespace: &str, key: &str) -> StoreResult<Staged> {
        let pk = self.path_key(key);
        let dir = self.root.join(namespace).join(pk.dir());
        fs::create_dir_all(&dir).await?;
        let path = dir.join(pk.full_key());
        let scratch = dir.join(format!("{}.{STAGING_SUFFIX}", pk.full_key()));
        let file = File::create(&scratch).await?;
        Ok(Staged { path, scratch, file })
    }
}

/// A write in progress. Content lands in a scratch file next to the target
/// and only replaces it once complete.
struct Staged {
    path: PathBuf,
    scratch: PathBuf,
    file: File,
}

impl Staged {
    async fn finish(
        self,
        key: &str,
        written: StoreResult<u64>,
        expected: Option<u64>,
    ) -> StoreResult<u64> {
        let Staged { path, scratch, mut file } = self;
        let result = match written {
            Ok(n) => match expected {
                Some(want) if want != n => Err(StoreError::Short {
                    key: key.to_string(),
                    expected: want,
                    got: n,
                }),
                _ => file.flush().await.map(|_| n).map_err(StoreError::from),
            },
            Err(e) => Err(e),
        };
        drop(file);

        match result {
            Ok(n) => {
                fs::rename(&scratch, &path).await?;
                info!(path = %path.display(), bytes = n, "wrote file to disk");
                Ok(n)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&scratch).await {
                    warn!(path = %scratch.display(), error = %rm, "could not discard partial write");
                }
                Err(e)
            }
        }
    }
}

async fn remove_dir_if_present(dir: &Path) -> StoreResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
