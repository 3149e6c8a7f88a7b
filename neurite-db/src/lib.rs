//! Flat-file JSON object store.
//!
//! The store maps an ordered sequence of path components to a `.json` file
//! under a data directory: `("users", "alice")` lives at `users/alice.json`.
//! Every object is held exclusively while referenced:
//!
//! - a per-path async mutex serializes tasks within this process, and
//! - an advisory write lock (`fs2`) guards against other processes.
//!
//! [`Db::lock`] returns a [`DbRef`] whose JSON tree may be freely mutated;
//! [`Db::unlock`] atomically rewrites the file (truncate + write) and returns
//! the object to the cache. Dropping a `DbRef` without unlocking releases the
//! locks and discards any mutation.
//!
//! Parsed objects are kept in a byte-bounded LRU cache. A lock that finds the
//! on-disk modification time newer than the cached stamp re-parses from disk,
//! so out-of-band writes are picked up. Cache accounting uses
//! [`neurite_json::estimate_size`] and evicts least-recently-locked objects
//! until the total fits `max_cache`; `max_cache == 0` disables caching.

mod cache;

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;

use cache::LruCache;

/// Failures surfaced by store operations.
#[derive(Debug)]
pub enum DbError {
    /// Underlying filesystem failure.
    Io(std::io::Error),

    /// The object's bytes did not parse as a JSON object.
    Corrupt(neurite_json::JsonError),

    /// `create` was called for a path that already exists.
    Exists,

    /// Another process holds the advisory lock on the object.
    Busy,

    /// An empty path sequence was given.
    EmptyPath,
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Io(e) => write!(f, "database I/O error: {e}"),
            DbError::Corrupt(e) => write!(f, "stored object is not valid JSON: {e}"),
            DbError::Exists => write!(f, "object already exists"),
            DbError::Busy => write!(f, "object is locked by another process"),
            DbError::EmptyPath => write!(f, "empty object path"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e)
    }
}

/// Current wall-clock time in unix milliseconds.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// File modification time in unix milliseconds, `None` if the file is
/// missing or the platform withholds mtimes.
fn mtime_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

/// Replace filesystem-significant bytes in a path component so a hostile
/// name cannot traverse out of the data directory.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            '/' => '_',
            '.' => '-',
            c => c,
        })
        .collect()
}

struct Meta {
    max_cache: usize,
    cache: LruCache,
}

struct Shared {
    dir: PathBuf,
    meta: Mutex<Meta>,
    /// One mutex per object path ever touched. Entries are never removed:
    /// a stale mutex must outlive every guard cloned from it, or two tasks
    /// could hold "the" lock for one path.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Handle to an open store. Cheap to clone; all clones share one cache.
#[derive(Clone)]
pub struct Db {
    shared: Arc<Shared>,
}

/// An exclusively held object.
///
/// The JSON tree is private to the holder until [`Db::unlock`] persists it.
#[derive(Debug)]
pub struct DbRef {
    path: Vec<String>,
    key: String,
    file: std::fs::File,
    json: Map<String, Value>,
    _guard: OwnedMutexGuard<()>,
}

impl DbRef {
    /// The path components this object was locked under.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn json(&self) -> &Map<String, Value> {
        &self.json
    }

    pub fn json_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.json
    }

    /// Replace the whole tree, e.g. when an endpoint swaps in a re-validated
    /// document.
    pub fn set_json(&mut self, json: Map<String, Value>) {
        self.json = json;
    }
}

impl Db {
    /// Open (creating if necessary) the store rooted at `dir` with a cache
    /// ceiling of `max_cache` bytes. Zero disables caching.
    pub fn open(dir: impl Into<PathBuf>, max_cache: usize) -> Result<Db, DbError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Db {
            shared: Arc::new(Shared {
                dir,
                meta: Mutex::new(Meta {
                    max_cache,
                    cache: LruCache::new(),
                }),
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Adjust the cache ceiling at runtime, evicting as needed.
    pub fn set_max_cache(&self, max_cache: usize) {
        let mut meta = self.shared.meta.lock().unwrap();
        meta.max_cache = max_cache;
        if max_cache == 0 {
            meta.cache.clear();
        } else {
            meta.cache.evict_to(max_cache);
        }
    }

    /// Current `(objects, bytes)` held by the cache.
    pub fn cache_stats(&self) -> (usize, usize) {
        let meta = self.shared.meta.lock().unwrap();
        (meta.cache.len(), meta.cache.total_bytes())
    }

    /// Whether `path` is currently cached. Debug introspection.
    pub fn cached(&self, path: &[&str]) -> bool {
        let key = Self::cache_key(path);
        self.shared.meta.lock().unwrap().cache.contains(&key)
    }

    fn cache_key(path: &[&str]) -> String {
        path.iter()
            .map(|c| sanitize(c))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn file_path(&self, path: &[&str]) -> PathBuf {
        let mut out = self.shared.dir.clone();
        for (i, component) in path.iter().enumerate() {
            if i + 1 == path.len() {
                out.push(format!("{}.json", sanitize(component)));
            } else {
                out.push(sanitize(component));
            }
        }
        out
    }

    fn dir_path(&self, path: &[&str]) -> PathBuf {
        let mut out = self.shared.dir.clone();
        for component in path {
            out.push(sanitize(component));
        }
        out
    }

    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.shared.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Lock an object for exclusive access.
    ///
    /// Returns `Ok(None)` if no object exists at `path`. Fails with
    /// [`DbError::Busy`] when another process holds the advisory lock, and
    /// [`DbError::Corrupt`] when the stored bytes do not parse.
    pub async fn lock(&self, path: &[&str]) -> Result<Option<DbRef>, DbError> {
        if path.is_empty() {
            return Err(DbError::EmptyPath);
        }
        let key = Self::cache_key(path);
        let guard = self.acquire(&key).await;
        self.lock_held(path, key, guard)
    }

    /// Create an object, failing if it already exists, and return it locked.
    ///
    /// The path mutex is held across the existence check, the file creation,
    /// and the subsequent lock, so a concurrent `lock` of the same path
    /// cannot interleave.
    pub async fn create(&self, path: &[&str]) -> Result<DbRef, DbError> {
        if path.is_empty() {
            return Err(DbError::EmptyPath);
        }
        let key = Self::cache_key(path);
        let guard = self.acquire(&key).await;

        let file = self.file_path(path);
        if file.exists() {
            return Err(DbError::Exists);
        }
        if path.len() > 1 {
            std::fs::create_dir_all(self.dir_path(&path[..path.len() - 1]))?;
        }
        std::fs::write(&file, b"{}")?;

        match self.lock_held(path, key, guard)? {
            Some(r) => Ok(r),
            // The file was just written, so a miss here is a real I/O fault.
            None => Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "object vanished during create",
            ))),
        }
    }

    /// The body of `lock`, entered with the per-path mutex already held.
    fn lock_held(
        &self,
        path: &[&str],
        key: String,
        guard: OwnedMutexGuard<()>,
    ) -> Result<Option<DbRef>, DbError> {
        let file_path = self.file_path(path);

        let mut file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A cached copy of a deleted file must not outlive it.
                self.shared.meta.lock().unwrap().cache.remove(&key);
                return Ok(None);
            }
            Err(e) => return Err(DbError::Io(e)),
        };

        if let Err(e) = file.try_lock_exclusive() {
            return if e.kind() == std::io::ErrorKind::WouldBlock {
                Err(DbError::Busy)
            } else {
                Err(DbError::Io(e))
            };
        }

        let disk_ts = mtime_ms(&file_path).unwrap_or(0);
        let mut meta = self.shared.meta.lock().unwrap();

        let cached = if meta.max_cache > 0 {
            meta.cache.get(&key)
        } else {
            None
        };

        let json = match cached {
            Some(entry) if disk_ts <= entry.ts => match entry.value {
                Value::Object(map) => map,
                _ => return Err(DbError::Corrupt(neurite_json::JsonError {
                    kind: neurite_json::JsonErrorKind::NotAnObject,
                    offset: 0,
                })),
            },
            Some(_) => {
                // File was modified on disk since it was cached.
                let map = read_object(&mut file)?;
                let size = neurite_json::estimate_size(&Value::Object(map.clone()));
                meta.cache
                    .update(&key, Value::Object(map.clone()), disk_ts, size);
                let max = meta.max_cache;
                meta.cache.evict_to(max);
                map
            }
            None => {
                let map = read_object(&mut file)?;
                if meta.max_cache > 0 {
                    let size = neurite_json::estimate_size(&Value::Object(map.clone()));
                    meta.cache
                        .insert(key.clone(), Value::Object(map.clone()), now_ms(), size);
                    let max = meta.max_cache;
                    meta.cache.evict_to(max);
                }
                map
            }
        };

        Ok(Some(DbRef {
            path: path.iter().map(|s| s.to_string()).collect(),
            key,
            file,
            json,
            _guard: guard,
        }))
    }

    /// Persist and release an object.
    ///
    /// The file is truncated and rewritten in one exclusive critical section;
    /// a crash leaves either the old bytes or the new bytes. A write failure
    /// is logged and reported, but the locks are released regardless.
    pub async fn unlock(&self, mut r: DbRef) -> Result<(), DbError> {
        let json = Value::Object(std::mem::take(&mut r.json));
        let encoded = neurite_json::encode(&json);

        let write = (|| -> std::io::Result<()> {
            r.file.seek(SeekFrom::Start(0))?;
            r.file.set_len(0)?;
            r.file.write_all(encoded.as_bytes())?;
            r.file.flush()
        })();

        if let Err(e) = &write {
            tracing::error!(path = %r.key, error = %e, "failed to rewrite object on unlock");
        }

        let mut meta = self.shared.meta.lock().unwrap();
        if meta.max_cache > 0 && meta.cache.contains(&r.key) {
            let size = neurite_json::estimate_size(&json);
            meta.cache.update(&r.key, json, now_ms(), size);
            let max = meta.max_cache;
            meta.cache.evict_to(max);
        }
        drop(meta);

        // File and path guard drop here, releasing both lock levels.
        write.map_err(DbError::Io)
    }

    /// Remove an object. Returns whether a file was actually deleted.
    pub async fn delete(&self, path: &[&str]) -> Result<bool, DbError> {
        if path.is_empty() {
            return Err(DbError::EmptyPath);
        }
        let key = Self::cache_key(path);
        let _guard = self.acquire(&key).await;

        self.shared.meta.lock().unwrap().cache.remove(&key);

        let file = self.file_path(path);
        match std::fs::remove_file(&file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    /// Whether an object exists at `path`. No parse, just a metadata probe.
    pub fn exists(&self, path: &[&str]) -> bool {
        !path.is_empty() && self.file_path(path).exists()
    }

    /// List the object names directly under a directory path, stripped of
    /// their `.json` suffix. A missing directory lists as empty.
    pub fn list(&self, path: &[&str]) -> Result<Vec<String>, DbError> {
        let dir = self.dir_path(path);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DbError::Io(e)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                out.push(stem.to_string());
            }
        }
        Ok(out)
    }
}

/// Read and strictly parse the whole file as a JSON object.
fn read_object(file: &mut std::fs::File) -> Result<Map<String, Value>, DbError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    neurite_json::decode_object(&bytes).map_err(DbError::Corrupt)
}
