use crate::config::{ChecksumPolicy, KnotConfig};
use crate::console;
use crate::ident::{Locator, LocatorHash};
use crate::{KnotError, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Bumped whenever the on-disk archive layout changes. Checksums are
/// qualified with this version so entries written by an older layout
/// can be told apart from genuine corruption.
pub const CACHE_VERSION: u32 = 1;

const COMPRESSION_TOKEN: &str = "gz";

/// Housekeeping files the cleanup pass must never delete.
const CLEANUP_ALLOW_LIST: &[&str] = &[".gitignore"];

/// A read handle over a cached archive. `release` closes the handle
/// without deleting the underlying cache file.
#[derive(Debug)]
pub struct ArchiveView {
    path: PathBuf,
    handle: Option<File>,
}

impl ArchiveView {
    fn new(path: PathBuf) -> Result<Self> {
        let handle = File::open(&path).map_err(|source| KnotError::ReadFile {
            path: path.clone(),
            source,
        })?;

        Ok(ArchiveView {
            path,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unpacks the gzipped tarball into `dest`.
    pub fn unpack_to(&mut self, dest: &Path) -> Result<()> {
        let file = self.handle.as_mut().ok_or_else(|| KnotError::Archive {
            path: self.path.clone(),
            source: std::io::Error::other("archive view was already released"),
        })?;

        file.seek(SeekFrom::Start(0))
            .map_err(|source| KnotError::Archive {
                path: self.path.clone(),
                source,
            })?;

        let decoder = flate2::read::GzDecoder::new(&mut *file);
        let mut archive = tar::Archive::new(decoder);

        archive.unpack(dest).map_err(|source| KnotError::Archive {
            path: dest.to_path_buf(),
            source,
        })
    }

    /// Callers must release the view once done with it; the cached file
    /// itself stays on disk.
    pub fn release(&mut self) {
        self.handle = None;
    }
}

#[derive(Debug)]
pub struct CacheFetchResult {
    pub view: ArchiveView,
    pub checksum: Option<String>,
}

#[derive(Default)]
pub struct CacheEvents {
    pub on_hit: Option<Box<dyn Fn(&Locator) + Send + Sync>>,
    pub on_miss: Option<Box<dyn Fn(&Locator) + Send + Sync>>,
}

/// Content-addressed, checksum-verified archive storage with per-
/// locator mutual exclusion and OS-level file locks for cross-process
/// safety.
pub struct Cache {
    cache_dir: PathBuf,
    mirror_dir: Option<PathBuf>,
    checksum_policy: ChecksumPolicy,
    check_cache: bool,
    skip_integrity_check: bool,
    immutable: bool,
    marked_files: StdMutex<BTreeSet<PathBuf>>,
    entry_locks: Mutex<BTreeMap<LocatorHash, Arc<Mutex<()>>>>,
}

impl Cache {
    pub fn new(config: &KnotConfig) -> Self {
        Cache {
            cache_dir: config.cache_dir.clone(),
            mirror_dir: config.mirror_dir.clone(),
            checksum_policy: config.checksum_policy,
            check_cache: config.check_cache,
            skip_integrity_check: config.skip_integrity_check,
            immutable: config.immutable_cache,
            marked_files: StdMutex::new(BTreeSet::new()),
            entry_locks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache-key-qualified checksum of a file: `<version>/<sha256 hex>`.
    pub fn checksum_of(path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|source| KnotError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let read = file.read(&mut buffer).map_err(|source| KnotError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;

            if read == 0 {
                break;
            }

            hasher.update(&buffer[..read]);
        }

        Ok(format!("{CACHE_VERSION}/{}", hex::encode(hasher.finalize())))
    }

    /// Deterministic on-disk location for a locator. With a mirror
    /// configured the name carries a truncated qualified checksum;
    /// otherwise it carries the cache version and compression token,
    /// which is enough because the local cache never outlives a
    /// version bump.
    pub fn entry_path(&self, locator: &Locator, expected_checksum: Option<&str>) -> PathBuf {
        let key = match (&self.mirror_dir, expected_checksum) {
            (Some(_), Some(expected)) => {
                let (version, digest) = split_checksum(expected);
                let short = &digest[..digest.len().min(10)];
                format!("{version}-{short}")
            }
            _ => format!("c{CACHE_VERSION}-{COMPRESSION_TOKEN}"),
        };

        self.cache_dir
            .join(format!("{}-{}.tgz", locator.slug(), key))
    }

    fn mirror_path(&self, locator: &Locator) -> Option<PathBuf> {
        self.mirror_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}-c{CACHE_VERSION}-{COMPRESSION_TOKEN}.tgz",
                locator.slug()
            ))
        })
    }

    fn mark(&self, path: &Path) {
        let mut marked = self.marked_files.lock().unwrap_or_else(|e| e.into_inner());
        marked.insert(path.to_path_buf());
    }

    /// Applies the checksum-mismatch policy. `throw` is forced in
    /// verification mode; `update` is forced when the drift is solely a
    /// cache-format version change, so old lockfiles don't spuriously
    /// fail.
    fn reconcile_checksum(
        &self,
        locator: &Locator,
        expected: &str,
        actual: &str,
    ) -> Result<String> {
        if expected == actual {
            return Ok(actual.to_string());
        }

        let (expected_version, _) = split_checksum(expected);

        let policy = if self.check_cache {
            ChecksumPolicy::Throw
        } else if expected_version != CACHE_VERSION.to_string() {
            ChecksumPolicy::Update
        } else {
            self.checksum_policy
        };

        match policy {
            ChecksumPolicy::Ignore => Ok(expected.to_string()),
            ChecksumPolicy::Update => {
                console::warn(&format!(
                    "{locator}: checksum drifted from {expected} to {actual}, updating"
                ));
                Ok(actual.to_string())
            }
            ChecksumPolicy::Throw => Err(KnotError::CacheChecksumMismatch {
                locator: locator.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
        }
    }

    async fn entry_lock(&self, locator: &Locator) -> Arc<Mutex<()>> {
        let mut locks = self.entry_locks.lock().await;
        locks
            .entry(locator.hash().clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fetches the archive for `locator`, consulting the cache first
    /// and invoking `loader` only on a true miss. Concurrent fetches of
    /// the same locator share one loader run.
    pub async fn fetch<F, Fut>(
        &self,
        locator: &Locator,
        expected_checksum: Option<&str>,
        events: &CacheEvents,
        loader: F,
    ) -> Result<CacheFetchResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let entry_lock = self.entry_lock(locator).await;
        let _guard = entry_lock.lock().await;

        let entry = self.entry_path(locator, expected_checksum);

        if entry.is_file() {
            if let Some(on_hit) = &events.on_hit {
                on_hit(locator);
            }

            let checksum = if self.skip_integrity_check {
                expected_checksum.map(|expected| expected.to_string())
            } else {
                let actual = Self::checksum_of(&entry)?;
                match expected_checksum {
                    Some(expected) => Some(self.reconcile_checksum(locator, expected, &actual)?),
                    None => Some(actual),
                }
            };

            self.mark(&entry);

            return Ok(CacheFetchResult {
                view: ArchiveView::new(entry)?,
                checksum,
            });
        }

        if self.immutable {
            return Err(KnotError::ImmutableCache {
                locator: locator.to_string(),
            });
        }

        if let Some(on_miss) = &events.on_miss {
            on_miss(locator);
        }

        // Read-through: the mirror may already hold this version.
        let loaded = match self.mirror_path(locator).filter(|path| path.is_file()) {
            Some(mirror) => {
                console::verbose(&format!("cache miss for {locator}, copying from mirror"));
                mirror
            }
            None => loader().await?,
        };

        let actual = Self::checksum_of(&loaded)?;
        let checksum = match expected_checksum {
            Some(expected) => self.reconcile_checksum(locator, expected, &actual)?,
            None => actual,
        };

        self.install_entry(&loaded, &entry)?;

        if let Some(mirror) = self.mirror_path(locator) {
            if !mirror.is_file() {
                self.install_mirror(&entry, &mirror)?;
            }
        }

        self.mark(&entry);

        Ok(CacheFetchResult {
            view: ArchiveView::new(entry)?,
            checksum: Some(checksum),
        })
    }

    /// Atomically moves a loaded archive into place, under an exclusive
    /// file lock scoped to the destination path.
    fn install_entry(&self, source: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| KnotError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let _lock = PathLock::acquire(dest)?;

        if dest.is_file() {
            // Another process got there first.
            return Ok(());
        }

        let staging = dest.with_extension("tmp");
        copy_or_reflink(source, &staging)?;

        fs::rename(&staging, dest).map_err(|source| KnotError::WriteFile {
            path: dest.to_path_buf(),
            source,
        })
    }

    fn install_mirror(&self, source: &Path, mirror: &Path) -> Result<()> {
        if let Some(parent) = mirror.parent() {
            fs::create_dir_all(parent).map_err(|source| KnotError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let _lock = PathLock::acquire(mirror)?;

        if mirror.is_file() {
            return Ok(());
        }

        let staging = mirror.with_extension("tmp");
        copy_or_reflink(source, &staging)?;

        fs::rename(&staging, mirror).map_err(|source| KnotError::WriteFile {
            path: mirror.to_path_buf(),
            source,
        })
    }

    /// Removes every cache file not touched by the current run. Returns
    /// the deleted paths.
    pub fn cleanup(&self) -> Result<Vec<PathBuf>> {
        if !self.cache_dir.is_dir() {
            return Ok(Vec::new());
        }

        let marked = {
            let guard = self.marked_files.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let mut removed = Vec::new();

        let entries = fs::read_dir(&self.cache_dir).map_err(|source| KnotError::ReadFile {
            path: self.cache_dir.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| KnotError::ReadFile {
                path: self.cache_dir.clone(),
                source,
            })?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();

            if CLEANUP_ALLOW_LIST.contains(&name.as_ref()) || name.ends_with(".lock") {
                continue;
            }

            if marked.contains(&path) {
                continue;
            }

            if self.immutable {
                return Err(KnotError::ImmutableCacheCleanup { path });
            }

            fs::remove_file(&path).map_err(|source| KnotError::WriteFile {
                path: path.clone(),
                source,
            })?;
            removed.push(path);
        }

        Ok(removed)
    }
}

/// Exclusive OS-level lock scoped to a destination path, held for the
/// lifetime of the guard.
struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    fn acquire(dest: &Path) -> Result<Self> {
        let path = dest.with_extension("lock");

        let file = File::create(&path).map_err(|source| KnotError::CacheLock {
            path: path.clone(),
            source,
        })?;

        file.lock_exclusive().map_err(|source| KnotError::CacheLock {
            path: path.clone(),
            source,
        })?;

        Ok(PathLock { file, path })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn split_checksum(value: &str) -> (String, &str) {
    match value.split_once('/') {
        Some((version, digest)) => (version.to_string(), digest),
        None => (String::new(), value),
    }
}

/// Clone-on-write when the filesystem supports it, plain copy
/// otherwise.
fn copy_or_reflink(source: &Path, dest: &Path) -> Result<()> {
    if reflink_copy::reflink(source, dest).is_ok() {
        return Ok(());
    }

    fs::copy(source, dest)
        .map(|_| ())
        .map_err(|source| KnotError::WriteFile {
            path: dest.to_path_buf(),
            source,
        })
}
