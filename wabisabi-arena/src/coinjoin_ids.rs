//! Record of coinjoins this coordinator produced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bitcoin::Txid;
use dashmap::DashSet;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use wabisabi_core::{CoinJoinIdStore, Result};

/// Txids of our own coinjoins, one per line on disk.
#[derive(Default)]
pub struct InMemoryCoinJoinIdStore {
    ids: DashSet<Txid>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl InMemoryCoinJoinIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the store persisted at `path`. Unparsable lines are skipped.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            path: Some(path.clone()),
            ..Self::default()
        };

        match fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    match line.parse::<Txid>() {
                        Ok(txid) => {
                            store.ids.insert(txid);
                        }
                        Err(e) => warn!(line, error = %e, "Skipping invalid coinjoin txid"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(count = store.len(), "Coinjoin ids loaded");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Writes the store atomically if it changed. A no-op when unpersisted.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut ids: Vec<String> = self.ids.iter().map(|id| id.to_string()).collect();
        ids.sort();
        let mut contents = ids.join("\n");
        contents.push('\n');

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await?;
        debug!(count = ids.len(), "Coinjoin ids saved");
        Ok(())
    }
}

impl CoinJoinIdStore for InMemoryCoinJoinIdStore {
    fn contains(&self, txid: &Txid) -> bool {
        self.ids.contains(txid)
    }

    fn add(&self, txid: Txid) -> bool {
        let added = self.ids.insert(txid);
        if added {
            self.dirty.store(true, Ordering::SeqCst);
        }
        added
    }
}
