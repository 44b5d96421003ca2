//! File-based sync connector: polls a flag configuration file's modification
//! time and reloads it on change.
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::SystemTime;

use crate::events::{EventBus, ProviderEvent};
use crate::flagset::{self, DocumentFormat};
use crate::store::FlagStore;
use crate::{Error, Result};

use super::{Connector, FileSourceConfig};

/// Watches a flag configuration document on disk.
///
/// `initialize` performs one synchronous load so the resolver can answer
/// immediately; afterwards a background thread polls the file's modification
/// time. A failed reload keeps the watcher alive and keeps the store serving
/// the last good snapshot.
pub struct FileConnector {
    config: FileSourceConfig,
    store: Arc<FlagStore>,
    events: Arc<EventBus>,
    worker: Option<Worker>,
}

struct Worker {
    join_handle: std::thread::JoinHandle<()>,
    stop_sender: SyncSender<()>,
}

impl FileConnector {
    /// Create a connector pushing into `store` and reporting on `events`.
    pub fn new(
        config: FileSourceConfig,
        store: Arc<FlagStore>,
        events: Arc<EventBus>,
    ) -> FileConnector {
        FileConnector {
            config,
            store,
            events,
            worker: None,
        }
    }
}

impl Connector for FileConnector {
    fn initialize(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let mut watch = WatchState::new();
        let first_load = watch.reload(&self.config, &self.store, &self.events);

        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let join_handle = {
            let config = self.config.clone();
            let store = self.store.clone();
            let events = self.events.clone();
            std::thread::Builder::new()
                .name("flagd-file-sync".to_owned())
                .spawn(move || loop {
                    match stop_receiver.recv_timeout(config.poll_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            watch.poll(&config, &store, &events);
                        }
                        Ok(()) => {
                            log::debug!(target: "flagd", "file watcher received stop command");
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "flagd", "file watcher stop channel disconnected");
                            return;
                        }
                    }
                })?
        };

        self.worker = Some(Worker {
            join_handle,
            stop_sender,
        });
        first_load
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // Error means the thread already exited (receiver dropped) or a stop
        // command is already queued; both are fine.
        let _ = worker.stop_sender.try_send(());
        worker.join_handle.join().map_err(|_| Error::ConnectorPanicked)
    }
}

/// Per-watcher bookkeeping: last seen modification time and health, so
/// error and recovered-ready events fire on transitions rather than on every
/// poll tick.
struct WatchState {
    last_modified: Option<SystemTime>,
    healthy: Option<bool>,
    loaded: bool,
}

impl WatchState {
    fn new() -> WatchState {
        WatchState {
            last_modified: None,
            healthy: None,
            loaded: false,
        }
    }

    /// One poll tick: reload when the modification time moved.
    fn poll(&mut self, config: &FileSourceConfig, store: &FlagStore, events: &EventBus) {
        let modified = match std::fs::metadata(&config.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                self.fail(events, &format!("cannot stat {}: {err}", config.path.display()));
                return;
            }
        };
        if self.last_modified == Some(modified) {
            return;
        }
        let _ = self.reload(config, store, events);
    }

    fn reload(
        &mut self,
        config: &FileSourceConfig,
        store: &FlagStore,
        events: &EventBus,
    ) -> Result<()> {
        self.last_modified = std::fs::metadata(&config.path)
            .and_then(|m| m.modified())
            .ok();

        let result = std::fs::read(&config.path)
            .map_err(Error::from)
            .and_then(|raw| {
                flagset::parse(&raw, DocumentFormat::from_path(&config.path), config.parse_mode)
            });

        match result {
            Ok(flag_set) => {
                let changed = store.replace(Arc::new(flag_set));
                if self.healthy != Some(true) {
                    self.healthy = Some(true);
                    events.emit(ProviderEvent::Ready);
                }
                // The initial load populates the store without announcing a
                // configuration change; only later deliveries do.
                if self.loaded && !changed.is_empty() {
                    events.emit(ProviderEvent::ConfigurationChanged(changed));
                }
                self.loaded = true;
                Ok(())
            }
            Err(err) => {
                self.fail(events, &err.to_string());
                Err(err)
            }
        }
    }

    fn fail(&mut self, events: &EventBus, message: &str) {
        if self.healthy != Some(false) {
            self.healthy = Some(false);
            log::warn!(target: "flagd", "file sync failed: {message}");
            events.emit(ProviderEvent::Error(message.to_owned()));
        }
    }
}
