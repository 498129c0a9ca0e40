//! Configuration snapshots and the backup store.
//!
//! The store is an external collaborator; [`MemoryBackupStore`] is the
//! in-process implementation used by tests and embedders. Stores are append
//! only: a snapshot, once put, is never replaced.

use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceType;
use crate::error::{ConfigError, Result};
use crate::platform::ConfigFormat;

/// Opaque backup identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(Uuid);

impl BackupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(Self).map_err(|_| {
            ConfigError::BackupNotFound { id: s.to_string() }.into()
        })
    }
}

impl Default for BackupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration captured from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub device_id: String,
    pub device_type: DeviceType,
    /// Cleaned configuration content, re-appliable as is.
    pub content: String,
    pub format: ConfigFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Set once the snapshot is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<BackupId>,
}

/// Stores snapshots by id.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Store a snapshot under a fresh id.
    async fn put(&self, snapshot: ConfigSnapshot) -> Result<BackupId>;

    /// Fetch a stored snapshot.
    async fn get(&self, id: &BackupId) -> Result<ConfigSnapshot>;
}

/// In-memory backup store, in insertion order.
#[derive(Default)]
pub struct MemoryBackupStore {
    snapshots: RwLock<IndexMap<BackupId, ConfigSnapshot>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids stored for a device, oldest first.
    pub fn ids_for(&self, device_id: &str) -> Vec<BackupId> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, s)| s.device_id == device_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn put(&self, mut snapshot: ConfigSnapshot) -> Result<BackupId> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        let mut id = BackupId::new();
        while snapshots.contains_key(&id) {
            id = BackupId::new();
        }
        snapshot.backup_id = Some(id);
        snapshots.insert(id, snapshot);
        Ok(id)
    }

    async fn get(&self, id: &BackupId) -> Result<ConfigSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::BackupNotFound { id: id.to_string() }.into())
    }
}
