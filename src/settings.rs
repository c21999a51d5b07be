//! Persisted CEC settings backed by sled
//!
//! The enable flags, OSD name and vendor ID survive restarts. Writes go
//! through a small actor with last-write-wins debouncing so toggling the
//! enable switch from a remote does not hammer flash storage; the pending
//! value is flushed when the debounce window expires and on shutdown.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

/// Key under which the settings blob is stored in sled
const SETTINGS_KEY: &[u8] = b"cec_settings";

/// The values the sink persists across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CecSettings {
    /// Master enable for the whole CEC engine
    pub enabled: bool,
    /// One-touch-play enable (Image/Text View On handling)
    pub otp_enabled: bool,
    /// OSD name announced on the bus
    pub osd_name: String,
    /// Vendor OUI as a hex string
    pub vendor_id: String,
}

impl Default for CecSettings {
    fn default() -> Self {
        CecSettings {
            enabled: true,
            otp_enabled: true,
            osd_name: "TV".to_string(),
            vendor_id: "0019FB".to_string(),
        }
    }
}

/// Commands understood by the settings actor
#[derive(Debug)]
enum SettingsCommand {
    Save(CecSettings),
    Load(oneshot::Sender<Option<CecSettings>>),
    Flush(oneshot::Sender<Result<()>>),
    /// Acked once the database is flushed and released, so a follow-up open
    /// of the same path does not race the file lock
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the settings actor; cheap to clone
#[derive(Clone)]
pub struct SettingsStoreHandle {
    cmd_tx: mpsc::Sender<SettingsCommand>,
}

struct SettingsStore {
    db: sled::Db,
    command_rx: mpsc::Receiver<SettingsCommand>,
    pending: Option<CecSettings>,
    last_write_ts: Instant,
    debounce_ms: u64,
}

impl SettingsStore {
    /// Open the database and spawn the actor task
    pub fn spawn(db_path: &str, debounce_ms: u64) -> Result<SettingsStoreHandle> {
        let db = sled::open(db_path)
            .with_context(|| format!("Failed to open settings database at: {}", db_path))?;

        info!("Settings store opened at: {}", db_path);

        let (cmd_tx, command_rx) = mpsc::channel(32);
        let store = SettingsStore {
            db,
            command_rx,
            pending: None,
            last_write_ts: Instant::now(),
            debounce_ms,
        };
        tokio::spawn(store.run());

        Ok(SettingsStoreHandle { cmd_tx })
    }

    async fn run(mut self) {
        debug!("Settings store started (debounce: {}ms)", self.debounce_ms);
        let tick = if self.debounce_ms > 0 {
            self.debounce_ms
        } else {
            1000
        };
        let mut ticker = tokio::time::interval(Duration::from_millis(tick));

        loop {
            tokio::select! {
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SettingsCommand::Save(settings) => {
                            trace!("Queuing settings write");
                            self.pending = Some(settings);
                            self.last_write_ts = Instant::now();
                            if self.debounce_ms == 0 {
                                self.flush_pending().await;
                            }
                        }
                        SettingsCommand::Load(response_tx) => {
                            let _ = response_tx.send(self.load());
                        }
                        SettingsCommand::Flush(response_tx) => {
                            self.flush_pending().await;
                            let _ = response_tx.send(Ok(()));
                        }
                        SettingsCommand::Shutdown(ack) => {
                            debug!("Settings store shutting down, flushing pending write");
                            self.flush_pending().await;
                            let SettingsStore { db, .. } = self;
                            drop(db);
                            let _ = ack.send(());
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.pending.is_some()
                        && self.debounce_ms > 0
                        && self.last_write_ts.elapsed() >= Duration::from_millis(self.debounce_ms)
                    {
                        self.flush_pending().await;
                    }
                }
            }
        }
    }

    async fn flush_pending(&mut self) {
        let Some(settings) = self.pending.take() else {
            return;
        };

        let json = match serde_json::to_vec(&settings) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize settings: {}", e);
                self.pending = Some(settings);
                return;
            }
        };

        let db = self.db.clone();
        let write_result = tokio::task::spawn_blocking(move || {
            db.insert(SETTINGS_KEY, json)?;
            db.flush()?;
            Ok::<_, sled::Error>(())
        })
        .await;

        match write_result {
            Ok(Ok(())) => trace!("Settings flushed to sled"),
            Ok(Err(e)) => error!("Failed to write settings to sled: {}", e),
            Err(e) => error!("Settings write task panicked: {}", e),
        }
    }

    fn load(&self) -> Option<CecSettings> {
        match self.db.get(SETTINGS_KEY) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    error!("Failed to parse stored settings, using defaults: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read settings from sled: {}", e);
                None
            }
        }
    }
}

impl SettingsStoreHandle {
    /// Open a store at `db_path` with the given debounce window
    pub fn spawn(db_path: &str, debounce_ms: u64) -> Result<Self> {
        SettingsStore::spawn(db_path, debounce_ms)
    }

    /// Queue a settings write (debounced, last write wins)
    pub async fn save(&self, settings: CecSettings) {
        let _ = self.cmd_tx.send(SettingsCommand::Save(settings)).await;
    }

    /// Load persisted settings, `None` when nothing was stored yet
    pub async fn load(&self) -> Option<CecSettings> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SettingsCommand::Load(tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Force any pending write to disk
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SettingsCommand::Flush(tx))
            .await
            .context("settings store is gone")?;
        rx.await.context("settings store dropped flush response")?
    }

    /// Flush, release the database and stop the actor
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SettingsCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}
