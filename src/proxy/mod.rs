mod handle;

pub use handle::{OpenMode, SeekWhence};

use handle::OpenFile;

use crate::cache::{CacheEntry, EvictionCache};
use crate::config::Config;
use crate::error::{Result, StashError};
use crate::paths::PathResolver;
use crate::store::RemoteStore;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Private working copies live under this subdirectory of the cache root,
/// out of the way of shared cache paths.
const WORK_DIR: &str = ".work";

/// Outcome of freshness-checking a path against the authoritative store.
enum Materialized {
    /// The shared cache copy holds real contents (hit, or miss fetched).
    Existing(CacheEntry),
    /// The store had nothing; an empty copy was just materialized for a
    /// create-capable open.
    Created(CacheEntry),
    /// The store had nothing and the open cannot create.
    Absent,
}

/// The caching proxy shared by all client sessions: one eviction cache, one
/// path resolver, one connection to the authoritative store.
pub struct Proxy {
    resolver: PathResolver,
    cache: EvictionCache,
    store: Arc<dyn RemoteStore>,
    /// Serializes the cache/store interactions of open, close, and unlink
    /// across sessions. Reads and writes on open descriptors do not take it.
    op_lock: Mutex<()>,
}

impl Proxy {
    pub fn new(config: &Config, store: Arc<dyn RemoteStore>) -> Result<Arc<Self>> {
        let cache_dir = config.cache.get_dir();
        std::fs::create_dir_all(cache_dir.join(WORK_DIR)).map_err(|e| {
            StashError::Config(format!(
                "Failed to create cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Arc::new(Proxy {
            resolver: PathResolver::new(cache_dir),
            cache: EvictionCache::new(config.cache.get_capacity()?),
            store,
            op_lock: Mutex::new(()),
        }))
    }

    /// Start a session for one connected client. The client id namespaces
    /// private working-copy files so sessions never collide.
    pub fn new_session(self: &Arc<Self>) -> Result<ClientSession> {
        let client_id = self.store.client_id().map_err(transport)?;
        self.store.set_client_id(client_id + 1).map_err(transport)?;
        tracing::debug!("new session: client id {}", client_id);

        Ok(ClientSession {
            proxy: Arc::clone(self),
            client_id,
            handles: DashMap::new(),
            next_fd: Mutex::new(0),
        })
    }

    /// Number of distinct paths currently cached.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Open-time consistency check. On a hit, compare the cached version
    /// against the store's and re-fetch the whole file if stale; on a miss,
    /// seed version 0 with the store and populate the cache copy.
    fn validate(&self, canonical: &str, create: bool) -> Result<Materialized> {
        if let Some(entry) = self.cache.get(canonical) {
            let server_version = self.store.version(canonical).map_err(transport)?;
            if server_version > entry.known_version {
                tracing::debug!(
                    "open: {:?} stale (cached {}, server {}), re-fetching",
                    canonical,
                    entry.known_version,
                    server_version
                );
                if entry.modified {
                    // close flushes before the entry can go stale, so a set
                    // flag here means writes are being lost.
                    tracing::warn!(
                        "open: {:?} has unflushed writes superseded by re-fetch",
                        canonical
                    );
                }
                let bytes = self.store.fetch(canonical).map_err(transport)?;
                write_file(&entry.cache_path, &bytes)?;
                self.cache.update(canonical, |e| {
                    e.known_version = server_version;
                    e.modified = false;
                });
                let mut refreshed = entry;
                refreshed.known_version = server_version;
                refreshed.modified = false;
                return Ok(Materialized::Existing(refreshed));
            }
            return Ok(Materialized::Existing(entry));
        }

        // Miss: the store's counter is seeded so later freshness checks have
        // a defined baseline.
        let cache_path = self.resolver.cache_path(canonical);
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.store.set_version(canonical, 0).map_err(transport)?;

        match self.store.fetch(canonical) {
            Ok(bytes) => {
                tracing::debug!("open: miss on {:?}, fetched {} bytes", canonical, bytes.len());
                write_file(&cache_path, &bytes)?;
                let entry = CacheEntry::new(cache_path, 0);
                self.cache.set(canonical, entry.clone());
                Ok(Materialized::Existing(entry))
            }
            Err(StashError::NotFound(_)) => {
                if !create {
                    return Ok(Materialized::Absent);
                }
                tracing::debug!("open: miss on {:?}, creating empty copy", canonical);
                File::create(&cache_path)?;
                let entry = CacheEntry::new(cache_path, 0);
                self.cache.set(canonical, entry.clone());
                Ok(Materialized::Created(entry))
            }
            Err(e) => Err(transport(e)),
        }
    }
}

/// One connected client: its open-file table and descriptor counter.
///
/// Descriptors are independent of each other, so reads and writes on
/// different descriptors proceed concurrently; only open, close, and unlink
/// serialize on the proxy-wide lock.
pub struct ClientSession {
    proxy: Arc<Proxy>,
    client_id: u64,
    handles: DashMap<u64, OpenFile>,
    next_fd: Mutex<u64>,
}

impl ClientSession {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn open_descriptors(&self) -> usize {
        self.handles.len()
    }

    fn alloc_fd(&self) -> u64 {
        let mut next = self.next_fd.lock();
        let fd = *next;
        *next = next.wrapping_add(1);
        fd
    }

    fn private_path(&self, canonical: &str, fd: u64) -> PathBuf {
        // The fd makes the name unique per descriptor; the flattened path is
        // only there to keep the file recognizable.
        let flat = canonical.replace('/', "_");
        self.proxy
            .resolver
            .cache_root()
            .join(WORK_DIR)
            .join(format!("c{}_fd{}_{}", self.client_id, fd, flat))
    }

    /// Open `raw_path` in the given mode and return a descriptor.
    ///
    /// Read-only opens share the cache copy; write-capable opens get a
    /// private per-descriptor copy so no other reader of the same path can
    /// observe partial writes.
    pub fn open(&self, raw_path: &str, mode: OpenMode) -> Result<u64> {
        tracing::debug!("open({:?}, {:?})", raw_path, mode);
        let canonical = self.proxy.resolver.resolve(raw_path)?;
        let fd = self.alloc_fd();

        let _guard = self.proxy.op_lock.lock();

        let create = matches!(mode, OpenMode::CreateIfMissing | OpenMode::CreateExclusive);
        let materialized = self.proxy.validate(&canonical, create)?;

        let open_file = match mode {
            OpenMode::ReadOnly => self.open_read_only(&canonical, materialized)?,
            OpenMode::WriteOnly => {
                let entry = match materialized {
                    Materialized::Existing(entry) => entry,
                    Materialized::Created(_) | Materialized::Absent => {
                        return Err(StashError::NotFound(PathBuf::from(canonical)));
                    }
                };
                if entry.cache_path.is_dir() {
                    return Err(StashError::IsDirectory(entry.cache_path));
                }
                self.open_writer(&canonical, &entry, fd)?
            }
            OpenMode::CreateIfMissing => {
                let entry = match materialized {
                    Materialized::Existing(entry) | Materialized::Created(entry) => entry,
                    Materialized::Absent => {
                        return Err(StashError::NotFound(PathBuf::from(canonical)));
                    }
                };
                if entry.cache_path.is_dir() {
                    return Err(StashError::IsDirectory(entry.cache_path));
                }
                self.open_writer(&canonical, &entry, fd)?
            }
            OpenMode::CreateExclusive => {
                let entry = match materialized {
                    Materialized::Existing(entry) => {
                        return Err(StashError::AlreadyExists(entry.cache_path));
                    }
                    Materialized::Created(entry) => entry,
                    Materialized::Absent => {
                        return Err(StashError::NotFound(PathBuf::from(canonical)));
                    }
                };
                self.open_writer(&canonical, &entry, fd)?
            }
        };

        self.handles.insert(fd, open_file);
        tracing::debug!("open: {:?} -> fd {}", canonical, fd);
        Ok(fd)
    }

    fn open_read_only(&self, canonical: &str, materialized: Materialized) -> Result<OpenFile> {
        let cache_path = match materialized {
            Materialized::Existing(entry) | Materialized::Created(entry) => entry.cache_path,
            Materialized::Absent => {
                // Not a cacheable blob, but nested cache paths make this a
                // real directory; its reads fail IsDirectory later.
                let local = self.proxy.resolver.cache_path(canonical);
                if local.is_dir() {
                    local
                } else {
                    return Err(StashError::NotFound(PathBuf::from(canonical)));
                }
            }
        };

        if cache_path.is_dir() {
            return Ok(OpenFile {
                path: canonical.to_string(),
                backing: cache_path,
                read_only: true,
                is_dir: true,
                private_path: None,
                file: None,
                wrote: AtomicBool::new(false),
            });
        }

        let file = File::open(&cache_path)?;
        Ok(OpenFile {
            path: canonical.to_string(),
            backing: cache_path,
            read_only: true,
            is_dir: false,
            private_path: None,
            file: Some(Arc::new(Mutex::new(file))),
            wrote: AtomicBool::new(false),
        })
    }

    /// Copy-on-open isolation: materialize the private working copy and open
    /// it read-write.
    fn open_writer(&self, canonical: &str, entry: &CacheEntry, fd: u64) -> Result<OpenFile> {
        let private = self.private_path(canonical, fd);
        std::fs::copy(&entry.cache_path, &private)?;

        // fs::copy preserves mode bits, so a read-only source yields a
        // private copy that refuses the read-write open.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&private)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    StashError::InvalidArgument(format!("{} is not writable", canonical))
                } else {
                    StashError::Io(e)
                }
            })?;
        Ok(OpenFile {
            path: canonical.to_string(),
            backing: private.clone(),
            read_only: false,
            is_dir: false,
            private_path: Some(private),
            file: Some(Arc::new(Mutex::new(file))),
            wrote: AtomicBool::new(false),
        })
    }

    /// Read up to `buf.len()` bytes at the descriptor's cursor. Returns the
    /// count actually read; 0 at end of stream.
    pub fn read(&self, fd: u64, buf: &mut [u8]) -> Result<usize> {
        // Clone the stream Arc so the table shard is released before I/O.
        let (file, is_dir, backing) = {
            let handle = self.handles.get(&fd).ok_or(StashError::BadDescriptor(fd))?;
            (handle.file.clone(), handle.is_dir, handle.backing.clone())
        };

        if is_dir {
            return Err(StashError::IsDirectory(backing));
        }
        let file = file.ok_or(StashError::BadDescriptor(fd))?;

        let mut stream = file.lock();
        let n = stream.read(buf).map_err(|e| {
            tracing::error!("read: fd {} failed: {}", fd, e);
            StashError::BadDescriptor(fd)
        })?;
        tracing::trace!("read: fd {} -> {} bytes", fd, n);
        Ok(n)
    }

    /// Write the whole buffer at the descriptor's cursor and mark the cached
    /// entry modified. Returns the byte count written.
    pub fn write(&self, fd: u64, buf: &[u8]) -> Result<usize> {
        let (file, read_only, is_dir, path) = {
            let handle = self.handles.get(&fd).ok_or(StashError::BadDescriptor(fd))?;
            (
                handle.file.clone(),
                handle.read_only,
                handle.is_dir,
                handle.path.clone(),
            )
        };

        if is_dir {
            return Err(StashError::IsDirectory(PathBuf::from(path)));
        }
        if read_only {
            return Err(StashError::BadDescriptor(fd));
        }
        let file = file.ok_or(StashError::BadDescriptor(fd))?;

        {
            let mut stream = file.lock();
            stream.write_all(buf).map_err(|e| {
                tracing::error!("write: fd {} failed: {}", fd, e);
                StashError::BadDescriptor(fd)
            })?;
        }

        if let Some(handle) = self.handles.get(&fd) {
            handle.wrote.store(true, Ordering::Relaxed);
        }
        self.proxy.cache.update(&path, |e| e.modified = true);
        tracing::trace!("write: fd {} -> {} bytes", fd, buf.len());
        Ok(buf.len())
    }

    /// Reposition the descriptor's cursor. `FromEnd` seeks to
    /// `length - offset`; a position before the start of the file is
    /// `InvalidArgument`. Returns the new absolute position.
    pub fn lseek(&self, fd: u64, offset: i64, whence: SeekWhence) -> Result<u64> {
        let file = {
            let handle = self.handles.get(&fd).ok_or(StashError::BadDescriptor(fd))?;
            handle.file.clone().ok_or(StashError::BadDescriptor(fd))?
        };

        let mut stream = file.lock();
        let target = match whence {
            SeekWhence::FromStart => offset,
            SeekWhence::FromCurrent => {
                let current = stream
                    .stream_position()
                    .map_err(|_| StashError::BadDescriptor(fd))? as i64;
                current + offset
            }
            SeekWhence::FromEnd => {
                let len = stream
                    .metadata()
                    .map_err(|_| StashError::BadDescriptor(fd))?
                    .len() as i64;
                len - offset
            }
        };

        if target < 0 {
            return Err(StashError::InvalidArgument(format!(
                "seek to negative position {}",
                target
            )));
        }

        stream
            .seek(SeekFrom::Start(target as u64))
            .map_err(|_| StashError::BadDescriptor(fd))?;
        tracing::trace!("lseek: fd {} -> {}", fd, target);
        Ok(target as u64)
    }

    /// Close a descriptor. A writer merges its private copy back onto the
    /// shared cache copy; a modified entry is pushed whole to the store in a
    /// single write-back, which bumps the authoritative version. The
    /// descriptor is removed even when closing fails.
    pub fn close(&self, fd: u64) -> Result<()> {
        tracing::debug!("close({})", fd);
        let (_, handle) = self
            .handles
            .remove(&fd)
            .ok_or(StashError::BadDescriptor(fd))?;

        // A stream-less handle (read-only directory open) has nothing to
        // merge or push; report it, descriptor already gone.
        let Some(file) = handle.file else {
            return Err(StashError::BadDescriptor(fd));
        };

        let _guard = self.proxy.op_lock.lock();

        let cached = self.proxy.cache.get(&handle.path);
        let cache_path = cached
            .as_ref()
            .map(|e| e.cache_path.clone())
            .unwrap_or_else(|| self.proxy.resolver.cache_path(&handle.path));

        if !handle.read_only {
            // Merge, then retire the private copy.
            let private = handle
                .private_path
                .as_deref()
                .ok_or(StashError::BadDescriptor(fd))?;
            std::fs::copy(private, &cache_path)?;
            if let Err(e) = std::fs::remove_file(private) {
                tracing::warn!(
                    "close: failed to remove private copy {}: {}",
                    private.display(),
                    e
                );
            }
        }

        // The shared `modified` flag may already have been cleared by an
        // overlapping writer's close, so a descriptor that wrote pushes its
        // own merge regardless. An evicted entry loses the flag entirely; a
        // writer then pushes unconditionally rather than lose the merge.
        let wrote = handle.wrote.load(Ordering::Relaxed);
        let modified = match &cached {
            Some(entry) => entry.modified || wrote,
            None => !handle.read_only,
        };

        if modified {
            let bytes = std::fs::read(&cache_path)?;
            self.proxy
                .store
                .push(&handle.path, &bytes)
                .map_err(transport)?;
            self.proxy.cache.update(&handle.path, |e| e.modified = false);
            tracing::debug!("close: pushed {:?} ({} bytes)", handle.path, bytes.len());
        }

        drop(file);
        Ok(())
    }

    /// Remove a file from the cache: invalidates this session's descriptors
    /// backed by it, drops its cache entry, and deletes the cached copy.
    /// Succeeds only if the deletion is verified.
    pub fn unlink(&self, raw_path: &str) -> Result<()> {
        tracing::debug!("unlink({:?})", raw_path);
        let canonical = self.proxy.resolver.resolve(raw_path)?;

        let _guard = self.proxy.op_lock.lock();

        let target = self.proxy.resolver.cache_path(&canonical);
        if !target.is_file() {
            return Err(StashError::NotFound(PathBuf::from(canonical)));
        }

        self.handles.retain(|fd, handle| {
            if handle.backing == target {
                tracing::debug!("unlink: invalidating fd {}", fd);
                false
            } else {
                true
            }
        });

        self.proxy.cache.remove(&canonical);
        std::fs::remove_file(&target)?;

        if target.exists() {
            return Err(StashError::Io(std::io::Error::other(format!(
                "unlink left {} in place",
                target.display()
            ))));
        }
        Ok(())
    }

    /// Session teardown: close every remaining stream and drop leftover
    /// private copies, best-effort. No write-back happens here; unflushed
    /// writers lose their data.
    pub fn session_end(&self) {
        let fds: Vec<u64> = self.handles.iter().map(|entry| *entry.key()).collect();
        if fds.is_empty() {
            return;
        }

        tracing::debug!("session_end: dropping {} open descriptors", fds.len());
        for fd in fds {
            if let Some((_, handle)) = self.handles.remove(&fd) {
                if let Some(private) = &handle.private_path {
                    if let Err(e) = std::fs::remove_file(private) {
                        tracing::warn!(
                            "session_end: failed to remove private copy {}: {}",
                            private.display(),
                            e
                        );
                    }
                }
                drop(handle);
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.session_end();
    }
}

/// Store-call failures that are not a plain missing path surface as
/// `Unavailable`: an open never proceeds on a failed fetch.
fn transport(e: StashError) -> StashError {
    match e {
        StashError::NotFound(path) => StashError::NotFound(path),
        other => StashError::Unavailable(other.to_string()),
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}
