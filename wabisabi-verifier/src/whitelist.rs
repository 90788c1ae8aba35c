//! Cache of coins the risk API found clean.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitcoin::OutPoint;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use wabisabi_core::{Result, SharedClock, SharedConfig};

/// A coin that passed verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Innocent {
    pub outpoint: OutPoint,
    pub verified_at: DateTime<Utc>,
}

/// Outpoints with a recent clean verdict.
///
/// Entries expire `release_from_whitelist_after` after verification, read
/// from the live config. Every add or remove bumps [`Whitelist::change_id`].
pub struct Whitelist {
    entries: RwLock<HashMap<OutPoint, Innocent>>,
    path: Option<PathBuf>,
    config: SharedConfig,
    clock: SharedClock,
    change_id: AtomicU64,
    dirty: AtomicBool,
}

impl Whitelist {
    /// Creates an empty, unpersisted whitelist.
    pub fn new(config: SharedConfig, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path: None,
            config,
            clock,
            change_id: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Opens a whitelist persisted at `path`. A missing file is an empty list.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, config: SharedConfig, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut whitelist = Self::new(config, clock);

        match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Vec<Innocent>>(&contents) {
                Ok(innocents) => {
                    let mut entries = whitelist.entries.write();
                    for innocent in innocents {
                        entries.insert(innocent.outpoint, innocent);
                    }
                }
                Err(e) => warn!(error = %e, "Whitelist file unreadable, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        whitelist.path = Some(path);
        let removed = whitelist.remove_expired();
        info!(count = whitelist.len(), expired = removed, "Whitelist loaded");
        Ok(whitelist)
    }

    fn is_expired(&self, innocent: &Innocent, now: DateTime<Utc>) -> bool {
        innocent.verified_at + self.config.read().coin_verifier.release_from_whitelist_after() <= now
    }

    /// Records a clean verdict for `outpoint`. Returns false if it was already listed.
    pub fn add(&self, outpoint: OutPoint) -> bool {
        let innocent = Innocent {
            outpoint,
            verified_at: self.clock.now(),
        };
        let is_new = self.entries.write().insert(outpoint, innocent).is_none();
        self.touch();
        debug!(%outpoint, "Whitelisted");
        is_new
    }

    /// Drops `outpoint`. Returns true if it was listed.
    pub fn remove(&self, outpoint: &OutPoint) -> bool {
        let removed = self.entries.write().remove(outpoint).is_some();
        self.touch();
        removed
    }

    /// Returns true if `outpoint` has an unexpired clean verdict.
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .get(outpoint)
            .map(|innocent| !self.is_expired(innocent, now))
            .unwrap_or(false)
    }

    /// Purges expired entries. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, innocent| !self.is_expired(innocent, now));
            before - entries.len()
        };
        if removed > 0 {
            self.touch();
        }
        removed
    }

    pub fn innocents(&self) -> Vec<Innocent> {
        let mut all: Vec<Innocent> = self.entries.read().values().cloned().collect();
        all.sort_by_key(|i| i.verified_at);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn change_id(&self) -> u64 {
        self.change_id.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.change_id.fetch_add(1, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Writes the whitelist if it changed since the last save.
    pub async fn flush(&self) -> Result<()> {
        if self.dirty.load(Ordering::SeqCst) {
            self.save().await?;
        }
        Ok(())
    }

    /// Writes the whitelist atomically. A no-op when unpersisted.
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let serialized = serde_json::to_vec_pretty(&self.innocents())?;
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&serialized).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await?;

        self.dirty.store(false, Ordering::SeqCst);
        debug!(count = self.len(), "Whitelist saved");
        Ok(())
    }
}
