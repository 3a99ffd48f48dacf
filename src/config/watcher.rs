use anyhow::Result;
use notify::{
    event::ModifyKind, Config as NotifyConfig, Event, EventKind, RecommendedWatcher,
    RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::Config;
use crate::bootstrap::ShutdownState;
use crate::telemetry::counters;
use crate::vendor::VendorSelector;

/// Configuration change event
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// Config file was modified and reloaded
    Reloaded(Arc<Config>),

    /// Config file was modified but reload failed
    ReloadFailed(String),
}

/// Hot reload watcher.
///
/// Only vendor selector weights are applied live; every other section needs
/// a restart.
pub struct ConfigWatcher {
    /// Path to config file
    path: PathBuf,

    /// File watcher
    watcher: RecommendedWatcher,

    /// Event receiver
    event_rx: mpsc::Receiver<notify::Result<Event>>,

    /// Current config
    current: watch::Sender<Arc<Config>>,

    /// Debounce duration (avoid rapid reloads)
    debounce: Duration,
}

impl ConfigWatcher {
    /// Create a new config watcher
    pub fn new(path: impl AsRef<Path>, initial: Arc<Config>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (event_tx, event_rx) = mpsc::channel(16);

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        let (current, _) = watch::channel(initial);

        Ok(Self {
            path,
            watcher,
            event_rx,
            current,
            debounce: Duration::from_millis(500),
        })
    }

    /// Start watching for config changes
    pub fn start(&mut self) -> Result<()> {
        info!(path = %self.path.display(), "starting config watcher");

        self.watcher
            .watch(&self.path, RecursiveMode::NonRecursive)?;

        Ok(())
    }

    /// Subscribe to config changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.current.subscribe()
    }

    /// Get current config
    pub fn current(&self) -> Arc<Config> {
        self.current.borrow().clone()
    }

    /// Re-read the file. A failed reload keeps the current config.
    pub fn reload(&self) -> ConfigEvent {
        match Config::load(&self.path) {
            Ok(config) => {
                let config = Arc::new(config);
                info!(
                    vendors = config.vendors.len(),
                    selector_channels = config.selector.len(),
                    "configuration reloaded"
                );

                self.current.send_replace(config.clone());
                ConfigEvent::Reloaded(config)
            }
            Err(e) => {
                warn!(error = %e, "configuration reload failed, keeping current config");
                ConfigEvent::ReloadFailed(e.to_string())
            }
        }
    }

    /// Process events (call in a loop)
    pub async fn process_events(&mut self) -> Option<ConfigEvent> {
        let event = self.event_rx.recv().await?;

        match event {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
                ) {
                    return None;
                }

                debug!(paths = ?event.paths, "config file modified");

                tokio::time::sleep(self.debounce).await;

                Some(self.reload())
            }
            Err(e) => {
                error!(error = %e, "file watcher error");
                None
            }
        }
    }

    /// Run the watcher loop, pushing reloaded weights into the selector.
    pub async fn run(
        mut self,
        selector: Arc<VendorSelector>,
        mut shutdown: watch::Receiver<ShutdownState>,
    ) {
        loop {
            tokio::select! {
                event = self.process_events() => {
                    match event {
                        Some(ConfigEvent::Reloaded(config)) => {
                            selector.reconfigure(config.selector_weights());
                            counters::config_reload(true);
                        }
                        Some(ConfigEvent::ReloadFailed(_)) => counters::config_reload(false),
                        None => {}
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() != ShutdownState::Running {
                        info!("config watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Channel;
    use crate::vendor::VendorId;
    use std::fs;
    use tempfile::tempdir;

    const BASE: &str = r#"
vendors:
  - vendor: gupshup
    base_url: "https://gupshup.test"
    channels:
      - channel: SMS
  - vendor: karix
    base_url: "https://karix.test"
    channels:
      - channel: SMS
"#;

    #[tokio::test]
    async fn test_reload_replaces_current() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, format!("{}selector:\n  SMS:\n    gupshup: 1\n", BASE)).unwrap();

        let initial = Arc::new(Config::load(&path).unwrap());
        let watcher = ConfigWatcher::new(&path, initial).unwrap();
        let mut rx = watcher.subscribe();

        fs::write(&path, format!("{}selector:\n  SMS:\n    karix: 5\n", BASE)).unwrap();
        let event = watcher.reload();

        assert!(matches!(event, ConfigEvent::Reloaded(_)));
        assert!(rx.has_changed().unwrap());
        let weights = rx.borrow_and_update().selector_weights();
        assert_eq!(weights[&Channel::Sms].get(&VendorId::Karix), Some(&5));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, BASE).unwrap();

        let initial = Arc::new(Config::load(&path).unwrap());
        let watcher = ConfigWatcher::new(&path, initial).unwrap();

        fs::write(&path, "vendors: []\n").unwrap();
        let event = watcher.reload();

        assert!(matches!(event, ConfigEvent::ReloadFailed(_)));
        assert_eq!(watcher.current().vendors.len(), 2);
    }
}
