//! Session handle store: persisted session key → proactive-delivery handle.
//!
//! Adapters that can only reply through a handle captured from an inbound item (e.g. a
//! per-conversation callback URL) record the latest handle here, so a message can be pushed
//! to the conversation later, even after a restart. The store never expires entries itself;
//! adapters check [`HandleEntry::is_expired`] at send time and remove stale entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::channels::Result;

/// Last known delivery handle for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleEntry {
    pub handle: String,
    /// Platform-defined expiry (unix ms), if the handle has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl HandleEntry {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at_ms: i64) -> Self {
        self.expires_at = Some(expires_at_ms);
        self
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(false, |t| now_ms >= t)
    }
}

/// In-memory cache backed by a JSON file rewritten in full on every save.
pub struct SessionHandleStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, HandleEntry>>,
}

impl SessionHandleStore {
    /// Open the store at `path`; a missing or unreadable file starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = read_entries(&path).await.unwrap_or_default();
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, HandleEntry>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    /// Upsert the handle for `key` and persist immediately. Saving an identical entry is a no-op.
    pub async fn save(&self, key: &str, entry: HandleEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.get(key) == Some(&entry) {
            return Ok(());
        }
        entries.insert(key.to_string(), entry);
        self.persist(&entries).await
    }

    /// Look up `key` in memory, then re-read the file once before reporting a miss
    /// (the mapping may have been written by a previous process).
    pub async fn load_handle(&self, key: &str) -> Option<HandleEntry> {
        if let Some(entry) = self.entries.read().await.get(key) {
            return Some(entry.clone());
        }
        let on_disk = read_entries(&self.path).await?;
        let found = on_disk.get(key).cloned();
        let mut entries = self.entries.write().await;
        for (k, v) in on_disk {
            entries.entry(k).or_insert(v);
        }
        found
    }

    /// Remove `key` and persist. Returns whether an entry existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&entries).await?;
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

async fn read_entries(path: &Path) -> Option<BTreeMap<String, HandleEntry>> {
    let s = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&s) {
        Ok(entries) => Some(entries),
        Err(e) => {
            log::warn!("handle store: ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}
