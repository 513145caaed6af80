//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{Policy, ReloadConfig};

/// A validated, complete policy set read from the configuration source.
pub type PolicySnapshot = Vec<Policy>;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    settings: ReloadConfig,
    update_tx: mpsc::UnboundedSender<PolicySnapshot>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for validated policy sets.
    pub fn new(path: &Path, settings: ReloadConfig) -> (Self, mpsc::UnboundedReceiver<PolicySnapshot>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                settings,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = ?path, "Policy file change detected, reloading");
                        reload(&path, &tx);
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(self.settings.poll_interval),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Load, validate and forward a snapshot. Invalid files never reach the engine.
fn reload(path: &Path, tx: &mpsc::UnboundedSender<PolicySnapshot>) {
    match load_config(path) {
        Ok(config) => {
            tracing::debug!(policies = config.policies.len(), "Policy file validated");
            if tx.send(config.policies).is_err() {
                tracing::warn!("Policy reload receiver dropped");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to reload policies. Keeping current configuration.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reload_forwards_valid_snapshot() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[[policies]]\nname = \"a\"\n\n[[policies]]\nname = \"b\"").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        reload(file.path(), &tx);

        let snapshot = rx.try_recv().unwrap();
        let names: Vec<_> = snapshot.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_reload_drops_invalid_snapshot() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[[policies]]\nname = \"a\"\n[policies.retry]\nmax_attempts = 0"
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        reload(file.path(), &tx);

        assert!(rx.try_recv().is_err());
    }
}
