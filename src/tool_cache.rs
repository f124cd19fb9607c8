//! Persistent cache of tool availability probes.
//!
//! Looking a tool up on PATH and running `--version` is cheap once but adds
//! up across components and runs, so results are kept in a JSON file under
//! the stratum home directory. Entries expire after a TTL unless the cache
//! is in offline mode, where a stale answer beats no answer at all.

use crate::providers::{SystemTimeProvider, TimeProvider, elapsed_since};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const EXPORT_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone)]
pub struct ToolCacheConfig {
    /// Backing file. `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
    pub ttl: Duration,
    pub save_interval: Duration,
}

impl Default for ToolCacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl: Duration::from_secs(24 * 60 * 60),
            save_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTool {
    pub available: bool,
    #[serde(default)]
    pub version: String,
    pub cached_at: DateTime<Utc>,
    /// Stored as whole milliseconds.
    #[serde(with = "ttl_millis")]
    pub ttl: Duration,
}

impl CachedTool {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_since(now, self.cached_at) > self.ttl
    }
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(ttl.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Portable snapshot produced by [`ToolCache::export_to`].
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub platform: String,
    pub entries: BTreeMap<String, CachedTool>,
}

/// Import payload before validation. Looser than [`CacheExport`] so that
/// bad files produce a precise error instead of a serde message.
#[derive(Debug, Deserialize)]
struct RawExport {
    version: Option<String>,
    exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    entries: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    available: bool,
    #[serde(default)]
    version: String,
    cached_at: Option<DateTime<Utc>>,
    ttl: i64,
}

#[derive(Debug, Error)]
pub enum CacheImportError {
    #[error("failed to read cache export: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache export is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported cache export version '{0}' (expected 1.0)")]
    UnsupportedVersion(String),

    #[error("cache export is missing exported_at")]
    MissingExportedAt,

    #[error("entry '{0}' has a negative ttl")]
    NegativeTtl(String),

    #[error("entry '{0}' has no cached_at timestamp")]
    ZeroTimestamp(String),
}

struct CacheState {
    entries: HashMap<String, CachedTool>,
    last_save: DateTime<Utc>,
    offline_mode: bool,
    /// Bumped for every snapshot taken for writing.
    generation: u64,
}

pub struct ToolCache {
    config: ToolCacheConfig,
    state: RwLock<CacheState>,
    /// Generation of the snapshot currently on disk. Writers hold the lock
    /// while writing, so an older snapshot never replaces a newer one.
    written: Arc<Mutex<u64>>,
    time: Arc<dyn TimeProvider>,
}

impl ToolCache {
    pub fn new(config: ToolCacheConfig) -> Self {
        Self::with_time_provider(config, Arc::new(SystemTimeProvider))
    }

    /// Creates a cache with a custom clock (for testing).
    pub fn with_time_provider(config: ToolCacheConfig, time: Arc<dyn TimeProvider>) -> Self {
        let now = time.now();
        Self {
            config,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                last_save: now,
                offline_mode: false,
                generation: 0,
            }),
            written: Arc::new(Mutex::new(0)),
            time,
        }
    }

    /// Creates a cache and loads whatever the backing file holds.
    pub fn open(config: ToolCacheConfig) -> Self {
        let cache = Self::new(config);
        cache.load();
        cache
    }

    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Returns the entry if present and not past its TTL.
    pub fn get(&self, tool: &str) -> Option<CachedTool> {
        let now = self.time.now();
        let state = self.state.read();
        state
            .entries
            .get(tool)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Like [`get`](Self::get), but ignores the TTL while in offline mode.
    pub fn get_with_offline_support(&self, tool: &str) -> Option<CachedTool> {
        {
            let state = self.state.read();
            if state.offline_mode {
                return state.entries.get(tool).cloned();
            }
        }
        self.get(tool)
    }

    /// Records a probe result and schedules a background save if the last
    /// one is older than the save interval.
    pub fn set(&self, tool: &str, available: bool, version: &str) {
        let now = self.time.now();
        let snapshot = {
            let mut state = self.state.write();
            state.entries.insert(
                tool.to_string(),
                CachedTool {
                    available,
                    version: version.to_string(),
                    cached_at: now,
                    ttl: self.config.ttl,
                },
            );
            if elapsed_since(now, state.last_save) > self.config.save_interval {
                state.last_save = now;
                state.generation += 1;
                Some((state.generation, state.entries.clone()))
            } else {
                None
            }
        };

        if let (Some((generation, entries)), Some(path)) = (snapshot, self.config.path.clone()) {
            schedule_save(self.written.clone(), path, generation, entries);
        }
    }

    /// Writes the whole cache to disk, replacing the file atomically.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.config.path.clone() else {
            return Ok(());
        };
        let (generation, entries) = {
            let mut state = self.state.write();
            state.last_save = self.time.now();
            state.generation += 1;
            (state.generation, state.entries.clone())
        };
        if persist_snapshot(&self.written, &path, generation, &entries)? {
            debug!("Saved {} tool cache entries to {:?}", entries.len(), path);
        }
        Ok(())
    }

    /// Replaces the in-memory entries with the file contents. A missing or
    /// unreadable file leaves the cache empty. Returns the number of entries
    /// loaded.
    pub fn load(&self) -> usize {
        let Some(path) = self.config.path.as_deref() else {
            return 0;
        };
        if !path.exists() {
            debug!("No tool cache at {:?}, starting empty", path);
            return 0;
        }

        let entries = fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                serde_json::from_str::<HashMap<String, CachedTool>>(&content).map_err(Into::into)
            });

        match entries {
            Ok(entries) => {
                let count = entries.len();
                self.state.write().entries = entries;
                info!("Tool cache loaded from {:?} with {} entries", path, count);
                count
            }
            Err(e) => {
                warn!("Ignoring unreadable tool cache {:?}: {}", path, e);
                self.state.write().entries.clear();
                0
            }
        }
    }

    pub fn clear(&self) {
        self.state.write().entries.clear();
        info!("Tool cache cleared");
    }

    /// Drops entries past their TTL. Nothing expires in offline mode.
    pub fn clear_expired(&self) -> usize {
        let now = self.time.now();
        let mut state = self.state.write();
        if state.offline_mode {
            return 0;
        }
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!("Removed {} expired tool cache entries", removed);
        }
        removed
    }

    pub fn set_offline_mode(&self, offline: bool) {
        let mut state = self.state.write();
        if state.offline_mode != offline {
            info!("Tool cache offline mode {}", if offline { "enabled" } else { "disabled" });
        }
        state.offline_mode = offline;
    }

    pub fn is_offline_mode(&self) -> bool {
        self.state.read().offline_mode
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, expired or not, sorted by tool name.
    pub fn snapshot(&self) -> BTreeMap<String, CachedTool> {
        self.state
            .read()
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    pub fn export_to(&self, path: &Path) -> Result<()> {
        let export = CacheExport {
            version: EXPORT_FORMAT_VERSION.to_string(),
            exported_at: self.time.now(),
            platform: current_platform(),
            entries: self.snapshot(),
        };
        write_json_atomic(path, &export)?;
        info!("Exported {} tool cache entries to {:?}", export.entries.len(), path);
        Ok(())
    }

    /// Merges an export into this cache. The file is validated as a whole
    /// before any entry is applied.
    pub fn import_from(&self, path: &Path) -> Result<usize, CacheImportError> {
        let content = fs::read_to_string(path)?;
        let raw: RawExport = serde_json::from_str(&content)?;

        match raw.version.as_deref() {
            Some(EXPORT_FORMAT_VERSION) => {}
            other => {
                return Err(CacheImportError::UnsupportedVersion(
                    other.unwrap_or_default().to_string(),
                ));
            }
        }
        if raw.exported_at.is_none() {
            return Err(CacheImportError::MissingExportedAt);
        }
        if raw.platform != current_platform() {
            warn!(
                "Importing tool cache exported on '{}' into '{}'; availability may differ",
                raw.platform,
                current_platform()
            );
        }

        let mut imported = HashMap::with_capacity(raw.entries.len());
        for (tool, entry) in raw.entries {
            if entry.ttl < 0 {
                return Err(CacheImportError::NegativeTtl(tool));
            }
            let cached_at = match entry.cached_at {
                Some(at) if at.timestamp() != 0 => at,
                _ => return Err(CacheImportError::ZeroTimestamp(tool)),
            };
            imported.insert(
                tool,
                CachedTool {
                    available: entry.available,
                    version: entry.version,
                    cached_at,
                    ttl: Duration::from_millis(entry.ttl as u64),
                },
            );
        }

        let count = imported.len();
        self.state.write().entries.extend(imported);
        info!("Imported {} tool cache entries from {:?}", count, path);
        Ok(count)
    }
}

pub fn current_platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn schedule_save(
    written: Arc<Mutex<u64>>,
    path: PathBuf,
    generation: u64,
    entries: HashMap<String, CachedTool>,
) {
    let write = move || {
        if let Err(e) = persist_snapshot(&written, &path, generation, &entries) {
            warn!("Background tool cache save to {:?} failed: {}", path, e);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

/// Writes `entries` unless a newer generation is already on disk. Returns
/// whether the file was written.
fn persist_snapshot(
    written: &Mutex<u64>,
    path: &Path,
    generation: u64,
    entries: &HashMap<String, CachedTool>,
) -> Result<bool> {
    let mut on_disk = written.lock();
    if generation <= *on_disk {
        debug!("Skipping stale tool cache snapshot {} (on disk: {})", generation, *on_disk);
        return Ok(false);
    }
    write_json_atomic(path, entries)?;
    *on_disk = generation;
    Ok(true)
}

/// Serializes `value` into a temp file next to `path`, then renames it into
/// place. The temp file is created owner-only.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create cache directory {parent:?}"))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {parent:?}"))?;
    let content = serde_json::to_string_pretty(value)?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    temp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move cache file into place at {path:?}"))?;
    Ok(())
}
