//! Userspace path cache in front of eRPC.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use secwatch_common::path::PathKey;

use crate::erpc::{ErpcClient, ErpcError, ErpcTransport};
use crate::events::{Payload, SecurityEvent};
use crate::metrics;

/// Resolved paths by key, evicting the least recently used.
pub struct PathResolver<T> {
    client: ErpcClient<T>,
    capacity: usize,
    tick: u64,
    entries: HashMap<PathKey, (String, u64)>,
    recency: BTreeMap<u64, PathKey>,
}

impl<T: ErpcTransport> PathResolver<T> {
    pub fn new(client: ErpcClient<T>, capacity: usize) -> Self {
        Self {
            client,
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub fn client(&self) -> &ErpcClient<T> {
        &self.client
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &PathKey) -> Option<String> {
        self.tick += 1;
        let tick = self.tick;
        let (path, last) = self.entries.get_mut(key)?;
        self.recency.remove(last);
        *last = tick;
        self.recency.insert(tick, *key);
        Some(path.clone())
    }

    fn insert(&mut self, key: PathKey, path: String) {
        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.recency.pop_first() {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        self.recency.insert(self.tick, key);
        if let Some((_, last)) = self.entries.insert(key, (path, self.tick)) {
            self.recency.remove(&last);
        }
    }

    /// Full path of `key`, asking the kernel on a miss. A stale read-out is
    /// retried once with a fresh challenge.
    pub fn resolve(&mut self, key: PathKey) -> Result<String, ErpcError> {
        if let Some(path) = self.touch(&key) {
            metrics::PATH_CACHE_HITS.inc();
            return Ok(path);
        }
        metrics::PATH_CACHE_MISSES.inc();

        let path = match self.client.resolve_path(key) {
            Err(ErpcError::ChallengeMismatch { .. }) => self.client.resolve_path(key)?,
            other => other?,
        };
        self.insert(key, path.clone());
        Ok(path)
    }

    pub fn invalidate(&mut self, key: &PathKey) {
        if let Some((_, last)) = self.entries.remove(key) {
            self.recency.remove(&last);
        }
    }

    /// Drops every path on `mount_id`.
    pub fn invalidate_mount(&mut self, mount_id: u32) {
        let stale: Vec<PathKey> = self.entries.keys().filter(|k| k.mount_id == mount_id).copied().collect();
        for key in stale {
            self.invalidate(&key);
        }
    }

    /// Fills in the paths of the files an event carries and forgets paths
    /// the event made stale.
    pub fn fill(&mut self, event: &mut SecurityEvent) {
        let renamed_or_unlinked = match &event.payload {
            Payload::MountReleased(m) => {
                self.invalidate_mount(m.mount_id);
                None
            }
            Payload::Unlink(u) => Some(u.file.key),
            Payload::Rename(r) => Some(r.source.key),
            _ => None,
        };
        self.fill_files(event);
        if let Some(key) = renamed_or_unlinked {
            self.invalidate(&key);
        }
    }

    fn fill_files(&mut self, event: &mut SecurityEvent) {
        for file in event.files_mut() {
            if file.key.is_zero() || file.is_fileless() {
                continue;
            }
            if file.flags.contains(&"path_id_invalidated") {
                self.invalidate(&file.key);
            }
            match self.resolve(file.key) {
                Ok(path) => file.path = Some(path),
                Err(e) => {
                    metrics::ERPC_ERRORS.with_label_values(&[error_reason(&e)]).inc();
                    debug!(key = ?file.key, error = %e, "path resolution failed");
                }
            }
        }
    }
}

fn error_reason(e: &ErpcError) -> &'static str {
    match e {
        ErpcError::Io(_) | ErpcError::Ioctl(_) => "io",
        ErpcError::CacheMiss(_) => "cache_miss",
        ErpcError::KeyMismatch { .. } => "key_mismatch",
        ErpcError::ChallengeMismatch { .. } => "challenge_mismatch",
        ErpcError::BlobTooLarge(_) => "blob_too_large",
    }
}
