//! Saved transport settings, optionally backed by a JSON file that is watched for edits.

use mimic_net::SettingsSource;
use mimic_traits::{MimicError, Result, TransportConfig};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SettingsStore {
    current: RwLock<TransportConfig>,
    path: Option<PathBuf>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl SettingsStore {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(TransportConfig::default()),
            path: None,
            watcher: Mutex::new(None),
        })
    }

    /// Loads `path` if it exists; later saves are written back to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let current = if path.exists() {
            let config = Self::load(&path)?;
            info!(path = %path.display(), "loaded saved settings");
            config
        } else {
            TransportConfig::default()
        };
        Ok(Arc::new(Self {
            current: RwLock::new(current),
            path: Some(path),
            watcher: Mutex::new(None),
        }))
    }

    fn load(path: &Path) -> Result<TransportConfig> {
        let doc = std::fs::read_to_string(path)
            .map_err(|e| MimicError::Configuration(format!("read {}: {e}", path.display())))?;
        TransportConfig::parse(&doc)
    }

    pub fn current(&self) -> TransportConfig {
        self.current.read().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replaces the saved settings with `doc` and persists them.
    pub fn replace(&self, doc: &str) -> Result<TransportConfig> {
        let config = TransportConfig::parse(doc)?;
        if let Some(path) = &self.path {
            std::fs::write(path, config.to_json()?)
                .map_err(|e| MimicError::Configuration(format!("write {}: {e}", path.display())))?;
        }
        *self.current.write() = config.clone();
        Ok(config)
    }

    /// Reloads the file whenever it changes on disk; `on_reload` runs after each effective change.
    pub fn start_watching<F>(self: &Arc<Self>, on_reload: F) -> anyhow::Result<()>
    where
        F: Fn(&TransportConfig) + Send + Sync + 'static,
    {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|n| n.to_os_string());
        let store = Arc::downgrade(self);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("settings watch error: {}", e);
                    return;
                }
            };
            if !(event.kind.is_modify() || event.kind.is_create()) {
                return;
            }
            if !event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name) {
                return;
            }
            let Some(store) = store.upgrade() else { return };

            match Self::load(&path) {
                Ok(config) => {
                    let changed = {
                        let mut current = store.current.write();
                        let changed = *current != config;
                        *current = config.clone();
                        changed
                    };
                    if changed {
                        info!(path = %path.display(), "settings reloaded");
                        on_reload(&config);
                    } else {
                        debug!("settings file touched without changes");
                    }
                }
                // Editors often write in several steps; the next event carries the full file.
                Err(e) => debug!(error = %e, "settings file not readable yet"),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);
        info!(dir = %dir.display(), "watching settings");
        Ok(())
    }
}

impl SettingsSource for SettingsStore {
    fn transport(&self) -> TransportConfig {
        self.current()
    }
}
