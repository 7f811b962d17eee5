//! Hot-reload coordination: filesystem watching with debounce over the
//! rules and plugin-descriptor directories, validate-then-swap snapshot
//! installation, and a polling fallback when the OS notification facility
//! is unavailable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use eg_config::ReloadConfig;
use eg_core::rule::{RuleStore, load_rules_dir};

use crate::supervisor::{self, Supervisor};
use crate::telemetry::GatewayMetrics;

pub struct ReloadCoordinator {
    pub config: ReloadConfig,
    pub rules_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub store: Arc<RuleStore>,
    pub supervisor: Arc<Supervisor>,
    pub metrics: Arc<GatewayMetrics>,
}

impl ReloadCoordinator {
    /// Run until cancelled. With `enabled = false` no watcher is created
    /// and the task exits immediately.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            eg_info!(conf, "hot reload disabled");
            return;
        }

        let (event_tx, event_rx) = mpsc::channel::<()>(16);
        let watcher = self.try_watcher(event_tx.clone());
        // graceful_fallback: a missing notification facility degrades to a
        // periodic mtime+size scan, logged once.
        if watcher.is_none() {
            eg_warn!(conf, "file notification unavailable, falling back to polling");
        }
        self.event_loop(event_rx, watcher.is_none(), cancel).await;
        drop(watcher);
    }

    fn try_watcher(&self, event_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
        let tx = event_tx;
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.try_send(());
            }
        })
        .ok()?;
        watcher
            .watch(&self.rules_dir, RecursiveMode::NonRecursive)
            .ok()?;
        watcher
            .watch(&self.plugin_dir, RecursiveMode::NonRecursive)
            .ok()?;
        Some(watcher)
    }

    async fn event_loop(
        &self,
        mut events: mpsc::Receiver<()>,
        polling: bool,
        cancel: CancellationToken,
    ) {
        let mut poll_tick = tokio::time::interval(self.config.poll_interval.as_duration());
        let mut signature = dir_signature(&self.rules_dir, &self.plugin_dir);

        loop {
            let triggered = tokio::select! {
                event = events.recv() => event.is_some(),
                _ = poll_tick.tick(), if polling => {
                    let next = dir_signature(&self.rules_dir, &self.plugin_dir);
                    let changed = next != signature;
                    signature = next;
                    changed
                }
                _ = cancel.cancelled() => return,
            };
            if !triggered {
                continue;
            }

            // Debounce: coalesce the burst, then reload once.
            tokio::time::sleep(self.config.debounce.as_duration()).await;
            while events.try_recv().is_ok() {}
            signature = dir_signature(&self.rules_dir, &self.plugin_dir);

            self.reload_rules();
            self.reload_plugins().await;
        }
    }

    /// Validate-then-swap: a snapshot that fails to load or compile leaves
    /// the running one untouched.
    fn reload_rules(&self) {
        let rules = match load_rules_dir(&self.rules_dir) {
            Ok(rules) => rules,
            Err(e) => {
                self.metrics
                    .reloads_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                eg_error!(conf, error = %e, "rule reload rejected (load)");
                return;
            }
        };
        match self.store.install(rules) {
            Ok(snapshot) => {
                self.metrics
                    .reloads_ok
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let ids: Vec<String> = snapshot
                    .rules()
                    .iter()
                    .map(|r| r.rule.id.clone())
                    .collect();
                self.metrics.set_rules(&ids);
                eg_info!(conf, rules = snapshot.len(), version = snapshot.version, "rule snapshot installed");
            }
            Err(e) => {
                self.metrics
                    .reloads_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                eg_error!(conf, error = %e, "rule reload rejected (validate)");
            }
        }
    }

    async fn reload_plugins(&self) {
        match supervisor::discover(&self.plugin_dir) {
            Ok(descriptors) => self.supervisor.reconcile(descriptors).await,
            Err(e) => {
                eg_error!(conf, error = %e, "plugin reload rejected");
            }
        }
    }
}

/// mtime+size fingerprint of both watched directories, for the polling
/// fallback.
fn dir_signature(rules_dir: &Path, plugin_dir: &Path) -> Vec<(PathBuf, SystemTime, u64)> {
    let mut entries = Vec::new();
    for dir in [rules_dir, plugin_dir] {
        let Ok(read) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in read.filter_map(Result::ok) {
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.path(), mtime, meta.len()));
        }
    }
    entries.sort();
    entries
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::SinkRegistry;
    use eg_config::PluginsConfig;
    use eg_core::bus::Bus;
    use std::time::Duration;

    fn write_rule(dir: &Path, file: &str, id: &str, expression: &str) {
        let body = serde_json::json!([{
            "id": id,
            "conditions": {"type": "expression", "expression": expression},
            "actions": [
                {"type": "alert", "parameters": {"level": "info", "message": "m"}}
            ]
        }]);
        std::fs::write(dir.join(file), serde_json::to_string_pretty(&body).unwrap()).unwrap();
    }

    async fn coordinator(
        rules_dir: &Path,
        plugin_dir: &Path,
    ) -> (Arc<RuleStore>, Arc<GatewayMetrics>, CancellationToken) {
        let bus = Bus::new(16);
        let store = Arc::new(RuleStore::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let root = CancellationToken::new();
        let supervisor = Supervisor::new(
            PluginsConfig::default(),
            bus,
            SinkRegistry::new(),
            root.clone(),
        );

        let coordinator = ReloadCoordinator {
            config: ReloadConfig {
                enabled: true,
                debounce: Duration::from_millis(50).into(),
                poll_interval: Duration::from_millis(50).into(),
            },
            rules_dir: rules_dir.to_path_buf(),
            plugin_dir: plugin_dir.to_path_buf(),
            store: Arc::clone(&store),
            supervisor,
            metrics: Arc::clone(&metrics),
        };
        let cancel = root.clone();
        tokio::spawn(coordinator.run(cancel.child_token()));
        tokio::task::yield_now().await;
        (store, metrics, root)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn valid_edit_installs_within_debounce() {
        let rules = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        let (store, _metrics, root) = coordinator(rules.path(), plugins.path()).await;

        write_rule(rules.path(), "a.json", "r1", "value > 10");
        wait_for("snapshot install", || store.snapshot().contains("r1")).await;
        root.cancel();
    }

    #[tokio::test]
    async fn invalid_expression_keeps_running_snapshot() {
        let rules = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        let (store, metrics, root) = coordinator(rules.path(), plugins.path()).await;

        write_rule(rules.path(), "a.json", "good", "value > 10");
        wait_for("initial install", || store.snapshot().contains("good")).await;
        let installed_version = store.snapshot().version;

        // Syntactically invalid expression: watcher records the config
        // error, running snapshot unchanged.
        write_rule(rules.path(), "b.json", "bad", "value > ");
        wait_for("rejection", || {
            metrics
                .reloads_failed
                .load(std::sync::atomic::Ordering::Relaxed)
                > 0
        })
        .await;
        assert!(store.snapshot().contains("good"));
        assert!(!store.snapshot().contains("bad"));
        assert_eq!(store.snapshot().version, installed_version);

        // The next valid edit applies normally.
        write_rule(rules.path(), "b.json", "bad", "value > 20");
        wait_for("recovery", || store.snapshot().contains("bad")).await;
        root.cancel();
    }
}
