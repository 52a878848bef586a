//! # File Storage
//!
//! Two-tier local storage for completed downloads. Files live in a temporary
//! or a permanent tier; a uid -> filename index per tier tracks them and can
//! optionally be persisted as JSON so cached files survive a restart.
//! Index entries whose backing file has disappeared are pruned lazily on the
//! next lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::CacheProvider;
use crate::media_type;

const TEMP_INDEX_FILE: &str = "temp_index.json";
const PERMANENT_INDEX_FILE: &str = "permanent_index.json";

/// Where a resource currently lives in the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    NotExisted,
    InTemp,
    InPermanent,
}

/// Storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Temp,
    Permanent,
}

/// Emitted whenever a resource moves between states.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub uid: String,
    pub from: CacheState,
    pub to: CacheState,
}

/// On-disk size of each tier, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct StorageSize {
    pub temp: u64,
    pub permanent: u64,
}

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; the `temp` and `permanent` tiers are created below it.
    pub root: PathBuf,
    /// Persist the uid -> filename indexes as JSON and reload them on start.
    pub persist_index: bool,
}

#[derive(Default)]
struct IndexMaps {
    temp: HashMap<String, String>,
    permanent: HashMap<String, String>,
}

/// Two-tier file storage with a process-local index.
pub struct FileStorage {
    temp_dir: PathBuf,
    permanent_dir: PathBuf,
    persist: bool,
    index: RwLock<IndexMaps>,
    state_changes: broadcast::Sender<StateChange>,
    cleared: broadcast::Sender<StorageTier>,
}

impl FileStorage {
    /// Open (or create) the storage under `config.root`, loading persisted
    /// indexes when enabled.
    pub fn new(config: StorageConfig) -> io::Result<Self> {
        let temp_dir = config.root.join("temp");
        let permanent_dir = config.root.join("permanent");
        std::fs::create_dir_all(&temp_dir)?;
        std::fs::create_dir_all(&permanent_dir)?;

        let mut index = IndexMaps::default();
        if config.persist_index {
            index.temp = load_index(&config.root.join(TEMP_INDEX_FILE));
            index.permanent = load_index(&config.root.join(PERMANENT_INDEX_FILE));
        }

        let (state_changes, _) = broadcast::channel(16);
        let (cleared, _) = broadcast::channel(16);

        Ok(Self {
            temp_dir,
            permanent_dir,
            persist: config.persist_index,
            index: RwLock::new(index),
            state_changes,
            cleared,
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn permanent_dir(&self) -> &Path {
        &self.permanent_dir
    }

    /// Subscribe to per-resource state transitions.
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    /// Subscribe to tier-cleared notifications.
    pub fn cleared_events(&self) -> broadcast::Receiver<StorageTier> {
        self.cleared.subscribe()
    }

    /// Current state of a resource, judged by index membership only.
    pub fn state(&self, uid: &str) -> CacheState {
        let index = self.index.read();
        if index.temp.contains_key(uid) {
            CacheState::InTemp
        } else if index.permanent.contains_key(uid) {
            CacheState::InPermanent
        } else {
            CacheState::NotExisted
        }
    }

    /// Path of the cached file for `uid`, checking the temp tier first.
    ///
    /// Entries whose backing file no longer exists are dropped from the
    /// index, so a stale index heals itself lookup by lookup.
    pub fn cached_path(&self, uid: &str) -> Option<PathBuf> {
        let mut index = self.index.write();

        if let Some(file_name) = index.temp.get(uid) {
            let path = self.temp_dir.join(file_name);
            if path.is_file() {
                return Some(path);
            }
            debug!(uid = %uid, "pruning stale temp index entry");
            index.temp.remove(uid);
            self.persist_tier(StorageTier::Temp, &index);
        }

        if let Some(file_name) = index.permanent.get(uid) {
            let path = self.permanent_dir.join(file_name);
            if path.is_file() {
                return Some(path);
            }
            debug!(uid = %uid, "pruning stale permanent index entry");
            index.permanent.remove(uid);
            self.persist_tier(StorageTier::Permanent, &index);
        }

        None
    }

    /// Write the provider's buffered data into the temp tier.
    pub async fn save_to_temp(&self, provider: &CacheProvider) -> io::Result<PathBuf> {
        self.save(provider, StorageTier::Temp).await
    }

    /// Write the provider's buffered data into the permanent tier.
    pub async fn save_to_permanent(&self, provider: &CacheProvider) -> io::Result<PathBuf> {
        self.save(provider, StorageTier::Permanent).await
    }

    async fn save(&self, provider: &CacheProvider, tier: StorageTier) -> io::Result<PathBuf> {
        let uid = provider.uid().to_string();
        let from = self.state(&uid);
        let file_name = file_name_for(&uid, provider.content_type().as_deref());
        let dir = match tier {
            StorageTier::Temp => &self.temp_dir,
            StorageTier::Permanent => &self.permanent_dir,
        };
        let path = dir.join(&file_name);

        // Write to a temporary name first so a crash never leaves a
        // half-written file behind an index entry.
        let staging = path.with_extension("tmp");
        fs::write(&staging, provider.current_data()).await?;
        fs::rename(&staging, &path).await?;

        let to = {
            let mut index = self.index.write();
            let to = match tier {
                StorageTier::Temp => {
                    index.temp.insert(uid.clone(), file_name);
                    CacheState::InTemp
                }
                StorageTier::Permanent => {
                    index.permanent.insert(uid.clone(), file_name);
                    CacheState::InPermanent
                }
            };
            self.persist_tier(tier, &index);
            to
        };

        debug!(uid = %uid, path = ?path, tier = ?tier, "saved cached data");
        let _ = self.state_changes.send(StateChange { uid, from, to });
        Ok(path)
    }

    /// Promote a temp-tier entry into the permanent tier.
    ///
    /// No-op unless the resource is currently in the temp tier.
    pub async fn move_to_permanent(&self, uid: &str) -> io::Result<()> {
        let (from_path, file_name) = {
            let index = self.index.read();
            match index.temp.get(uid) {
                Some(file_name) => (self.temp_dir.join(file_name), file_name.clone()),
                None => return Ok(()),
            }
        };

        let to_path = self.permanent_dir.join(&file_name);
        fs::rename(&from_path, &to_path).await?;

        {
            let mut index = self.index.write();
            index.temp.remove(uid);
            index.permanent.insert(uid.to_string(), file_name);
            self.persist_tier(StorageTier::Temp, &index);
            self.persist_tier(StorageTier::Permanent, &index);
        }

        debug!(uid = %uid, "moved cached file to permanent storage");
        let _ = self.state_changes.send(StateChange {
            uid: uid.to_string(),
            from: CacheState::InTemp,
            to: CacheState::InPermanent,
        });
        Ok(())
    }

    /// Delete the cached file and index entry for `uid`, whichever tier it
    /// lives in.
    pub async fn delete(&self, uid: &str) -> io::Result<()> {
        let from = self.state(uid);
        let path = match from {
            CacheState::NotExisted => return Ok(()),
            CacheState::InTemp | CacheState::InPermanent => match self.cached_path(uid) {
                Some(path) => path,
                // Lookup already pruned the stale entry.
                None => return Ok(()),
            },
        };

        fs::remove_file(&path).await?;

        {
            let mut index = self.index.write();
            index.temp.remove(uid);
            index.permanent.remove(uid);
            self.persist_tier(StorageTier::Temp, &index);
            self.persist_tier(StorageTier::Permanent, &index);
        }

        debug!(uid = %uid, "deleted cached file");
        let _ = self.state_changes.send(StateChange {
            uid: uid.to_string(),
            from,
            to: CacheState::NotExisted,
        });
        Ok(())
    }

    /// Remove every file in the temp tier and reset its index.
    pub async fn clear_temp(&self) -> io::Result<()> {
        self.clear_tier(StorageTier::Temp).await
    }

    /// Remove every file in the permanent tier and reset its index.
    pub async fn clear_permanent(&self) -> io::Result<()> {
        self.clear_tier(StorageTier::Permanent).await
    }

    /// Clear both tiers.
    pub async fn clear_all(&self) -> io::Result<()> {
        self.clear_tier(StorageTier::Temp).await?;
        self.clear_tier(StorageTier::Permanent).await
    }

    async fn clear_tier(&self, tier: StorageTier) -> io::Result<()> {
        let dir = match tier {
            StorageTier::Temp => &self.temp_dir,
            StorageTier::Permanent => &self.permanent_dir,
        };

        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!(path = ?entry.path(), error = %e, "failed to remove cached file");
            }
        }

        {
            let mut index = self.index.write();
            match tier {
                StorageTier::Temp => index.temp.clear(),
                StorageTier::Permanent => index.permanent.clear(),
            }
            self.persist_tier(tier, &index);
        }

        debug!(tier = ?tier, "cleared storage tier");
        let _ = self.cleared.send(tier);
        Ok(())
    }

    /// Total size on disk of each tier.
    pub async fn calculate_size(&self) -> io::Result<StorageSize> {
        Ok(StorageSize {
            temp: dir_size(&self.temp_dir).await?,
            permanent: dir_size(&self.permanent_dir).await?,
        })
    }

    fn persist_tier(&self, tier: StorageTier, index: &IndexMaps) {
        if !self.persist {
            return;
        }
        let (map, path) = match tier {
            StorageTier::Temp => (&index.temp, self.index_path(TEMP_INDEX_FILE)),
            StorageTier::Permanent => (&index.permanent, self.index_path(PERMANENT_INDEX_FILE)),
        };
        match serde_json::to_vec(map) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(path = ?path, error = %e, "failed to persist storage index");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize storage index"),
        }
    }

    fn index_path(&self, file_name: &str) -> PathBuf {
        // Both tier directories share the same parent.
        self.temp_dir
            .parent()
            .unwrap_or(&self.temp_dir)
            .join(file_name)
    }
}

fn load_index(path: &Path) -> HashMap<String, String> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = ?path, error = %e, "ignoring unreadable storage index");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

/// Filename for a cached resource: a digest of its uid plus an extension
/// derived from the content type when one is known.
fn file_name_for(uid: &str, content_type: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uid);
    let hash = hasher.finalize();
    match content_type.and_then(media_type::extension_from_mime) {
        Some(ext) => format!("{hash:x}.{ext}"),
        None => format!("{hash:x}"),
    }
}

async fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}
