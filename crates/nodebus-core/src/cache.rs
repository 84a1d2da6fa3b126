//! Persistent hardware id -> bus address cache.
//!
//! The registry consults the cache so that a node gets the same address
//! every time it connects, including across daemon restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::id::{NodeId, Udid};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed node cache: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("Failed to encode node cache: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Durable mapping between hardware ids and bus addresses.
pub trait NodeCache: Send + Sync {
    /// Address previously assigned to `udid`, if any.
    fn lookup(&self, udid: &Udid) -> Option<NodeId>;

    /// Check if `id` is bound to a hardware id other than `udid`.
    fn is_reserved(&self, id: NodeId, udid: &Udid) -> bool;

    /// Bind `udid` to `id`, dropping any previous binding of either.
    fn set_entry(&mut self, udid: Udid, id: NodeId);
}

/// In-memory cache, lost on restart.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryNodeCache {
    #[serde(default)]
    nodes: BTreeMap<Udid, NodeId>,
}

impl MemoryNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeCache for MemoryNodeCache {
    fn lookup(&self, udid: &Udid) -> Option<NodeId> {
        self.nodes.get(udid).copied()
    }

    fn is_reserved(&self, id: NodeId, udid: &Udid) -> bool {
        self.nodes.iter().any(|(k, v)| *v == id && k != udid)
    }

    fn set_entry(&mut self, udid: Udid, id: NodeId) {
        self.nodes.retain(|k, v| *v != id || *k == udid);
        self.nodes.insert(udid, id);
    }
}

/// Cache backed by a TOML file, rewritten on every change.
///
/// ```toml
/// [nodes]
/// "00:11:22:33:44:55:66:77" = 5
/// ```
#[derive(Debug)]
pub struct FileNodeCache {
    path: PathBuf,
    entries: MemoryNodeCache,
}

impl FileNodeCache {
    /// Open the cache at `path`. A missing file yields an empty cache.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            debug!(path = %path.display(), "No node cache yet, starting empty");
            MemoryNodeCache::new()
        };
        info!(path = %path.display(), entries = entries.len(), "Loaded node cache");
        Ok(Self { path, entries })
    }

    /// Write the cache to disk.
    pub fn save(&self) -> Result<(), CacheError> {
        let content = toml::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl NodeCache for FileNodeCache {
    fn lookup(&self, udid: &Udid) -> Option<NodeId> {
        self.entries.lookup(udid)
    }

    fn is_reserved(&self, id: NodeId, udid: &Udid) -> bool {
        self.entries.is_reserved(id, udid)
    }

    fn set_entry(&mut self, udid: Udid, id: NodeId) {
        if self.entries.lookup(&udid) == Some(id) && !self.entries.is_reserved(id, &udid) {
            return;
        }
        self.entries.set_entry(udid, id);
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist node cache");
        }
    }
}
