//! Prison lifecycle: load, persist, release.
//!
//! The offender log is a JSON-lines file, one [`Offender`] per line, only
//! ever appended to while running. On open it is replayed into a fresh
//! [`Prison`], stripped of coins that were spent by our own coinjoins and of
//! expired records, and rewritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use wabisabi_core::{CoinJoinIdStore, Result, SharedClock, SharedConfig};

use crate::offense::Offender;
use crate::prison::Prison;

/// Owns the [`Prison`] and its persistence tasks.
pub struct Warden {
    path: PathBuf,
    prison: Arc<Prison>,
    config: SharedConfig,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Offender>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Warden {
    /// Loads the offender log at `path` and builds the prison from it.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(
        path: impl AsRef<Path>,
        config: SharedConfig,
        clock: SharedClock,
        coinjoin_ids: &dyn CoinJoinIdStore,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let offenders = read_offenders(&path).await?;
        let total = offenders.len();

        let kept: Vec<Offender> = offenders
            .into_iter()
            .filter(|o| !coinjoin_ids.contains(&o.outpoint.txid))
            .collect();
        let dropped = total - kept.len();

        let (prison, receiver) = Prison::with_log(Arc::clone(&config), clock);
        prison.restore(kept);
        prison.release_eligible_inmates();

        let compacted = prison.offenders();
        write_all(&path, &compacted).await?;

        let (noted, banned) = prison.count_inmates();
        info!(total, dropped, noted, banned, "Prison loaded");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            path,
            prison: Arc::new(prison),
            config,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn prison(&self) -> Arc<Prison> {
        Arc::clone(&self.prison)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawns the log appender and the periodic release loop.
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!("Warden already started");
            return;
        };

        let serializer = tokio::spawn(run_serializer(self.path.clone(), receiver, self.shutdown.subscribe()));

        let prison = Arc::clone(&self.prison);
        let period = self.config.read().prison.release_check_interval();
        let mut shutdown = self.shutdown.subscribe();
        let releaser = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        prison.release_eligible_inmates();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        self.tasks.lock().extend([serializer, releaser]);
        debug!("Warden started");
    }

    /// Stops background tasks after flushing pending offenders to disk.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Warden task panicked");
            }
        }
        info!("Warden stopped");
    }
}

async fn run_serializer(
    path: PathBuf,
    mut receiver: mpsc::UnboundedReceiver<Offender>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = receiver.recv() => {
                let Some(first) = next else { break };
                let mut batch = vec![first];
                while let Ok(more) = receiver.try_recv() {
                    batch.push(more);
                }
                if let Err(e) = append(&path, &batch).await {
                    error!(error = %e, count = batch.len(), "Failed to append offenders");
                }
            }
            _ = shutdown.changed() => {
                let mut batch = Vec::new();
                while let Ok(more) = receiver.try_recv() {
                    batch.push(more);
                }
                if !batch.is_empty() {
                    if let Err(e) = append(&path, &batch).await {
                        error!(error = %e, count = batch.len(), "Failed to flush offenders");
                    }
                }
                break;
            }
        }
    }
}

/// Reads the offender log. A missing file is an empty log; unreadable lines are skipped.
pub async fn read_offenders(path: &Path) -> Result<Vec<Offender>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut offenders = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Offender::from_json_line(line) {
            Ok(offender) => offenders.push(offender),
            Err(e) => warn!(line = number + 1, error = %e, "Skipping unreadable offender"),
        }
    }
    Ok(offenders)
}

#[instrument(skip(offenders), fields(count = offenders.len()))]
async fn append(path: &Path, offenders: &[Offender]) -> Result<()> {
    let mut buf = String::new();
    for offender in offenders {
        buf.push_str(&offender.to_json_line()?);
        buf.push('\n');
    }

    let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(buf.as_bytes()).await?;
    file.sync_data().await?;
    Ok(())
}

async fn write_all(path: &Path, offenders: &[Offender]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut buf = String::new();
    for offender in offenders {
        buf.push_str(&offender.to_json_line()?);
        buf.push('\n');
    }

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(buf.as_bytes()).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}
