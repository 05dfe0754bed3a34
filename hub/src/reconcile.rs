//! Reconciliation of live connections against a configuration snapshot
//!
//! Each source has its own lock so passes over one source never overlap,
//! while the entries inside a pass are worked on concurrently.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{validate_server_config, ConfigManager, ConfigSource, ServerConfig};
use crate::connection::Connection;
use crate::error::{HubError, HubResult};
use crate::factory::ConnectionFactory;

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub closed: Vec<String>,
    pub recreated: Vec<String>,
    pub patched: Vec<String>,
    /// Entries skipped, with the reason
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    /// True when no connection was touched
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.closed.is_empty()
            && self.recreated.is_empty()
            && self.patched.is_empty()
            && self.failed.is_empty()
    }

    fn record(&mut self, name: String, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Created => self.created.push(name),
            EntryOutcome::Closed => self.closed.push(name),
            EntryOutcome::Recreated => self.recreated.push(name),
            EntryOutcome::Patched => self.patched.push(name),
            EntryOutcome::Failed(reason) => self.failed.push((name, reason)),
            EntryOutcome::Unchanged => {}
        }
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} closed, {} recreated, {} patched, {} failed",
            self.created.len(),
            self.closed.len(),
            self.recreated.len(),
            self.patched.len(),
            self.failed.len()
        )
    }
}

#[derive(Debug)]
enum EntryOutcome {
    Created,
    Closed,
    Recreated,
    Patched,
    Unchanged,
    Failed(String),
}

pub struct ConnectionManager {
    factory: Arc<ConnectionFactory>,
    config: Arc<ConfigManager>,
    global_lock: Mutex<()>,
    project_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<ConnectionFactory>, config: Arc<ConfigManager>) -> Self {
        Self {
            factory,
            config,
            global_lock: Mutex::new(()),
            project_lock: Mutex::new(()),
        }
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    fn lock_for(&self, source: ConfigSource) -> &Mutex<()> {
        match source {
            ConfigSource::Global => &self.global_lock,
            ConfigSource::Project => &self.project_lock,
        }
    }

    /// Converge the live connections of `source` to `configs`.
    ///
    /// Live servers missing from `configs` are closed. Each entry is then
    /// validated on its own: an invalid entry is reported and skipped, a
    /// disabled one is closed, a changed transport is recreated, and any
    /// other change is patched into the live record.
    pub async fn update_server_connections(
        &self,
        configs: &Map<String, Value>,
        source: ConfigSource,
    ) -> ReconcileReport {
        let _pass = self.lock_for(source).lock().await;
        let mut report = ReconcileReport::default();

        let removed: Vec<String> = self
            .factory
            .names_for(source)
            .into_iter()
            .filter(|name| !configs.contains_key(name))
            .collect();
        join_all(
            removed
                .iter()
                .map(|name| self.factory.close_connection(name, Some(source), false)),
        )
        .await;
        report.closed.extend(removed);

        let outcomes = join_all(
            configs
                .iter()
                .map(|(name, raw)| self.reconcile_entry(name, raw, source)),
        )
        .await;
        for (name, outcome) in outcomes {
            report.record(name, outcome);
        }

        if report.is_noop() {
            debug!("{} servers already up to date", source);
        } else {
            info!("Reconciled {} servers: {}", source, report);
        }
        report
    }

    async fn reconcile_entry(&self, name: &str, raw: &Value, source: ConfigSource) -> (String, EntryOutcome) {
        let config = match validate_server_config(name, raw) {
            Ok(config) => config,
            Err(errors) => {
                let err = HubError::ConfigValidation {
                    context: name.to_string(),
                    errors,
                };
                warn!("Skipping {} server '{}': {}", source, name, err);
                return (name.to_string(), EntryOutcome::Failed(err.to_string()));
            }
        };

        let outcome = match self.factory.find(name, source) {
            Some(_) if config.disabled => {
                self.factory.close_connection(name, Some(source), false).await;
                EntryOutcome::Closed
            }
            Some(live) if live.config().requires_reconnect(&config) => {
                info!("Transport settings of '{}' changed, reconnecting", name);
                self.create(name, config, source, EntryOutcome::Recreated).await
            }
            Some(live) => patch(&live, config),
            None if config.disabled => EntryOutcome::Unchanged,
            None => self.create(name, config, source, EntryOutcome::Created).await,
        };
        (name.to_string(), outcome)
    }

    async fn create(
        &self,
        name: &str,
        config: ServerConfig,
        source: ConfigSource,
        success: EntryOutcome,
    ) -> EntryOutcome {
        match self.factory.create_connection(name, config, source).await {
            Ok(_) => success,
            Err(e) => {
                warn!("Failed to create connection '{}' ({}): {}", name, source, e);
                EntryOutcome::Failed(e.to_string())
            }
        }
    }

    /// Reconcile both sources once. A missing workspace skips the project
    /// source; other read failures are logged.
    pub async fn initialize_connections(&self) -> Vec<(ConfigSource, ReconcileReport)> {
        let mut reports = Vec::new();
        for source in ConfigSource::ALL {
            match self.config.read_servers(source) {
                Ok(servers) => {
                    let report = self.update_server_connections(&servers, source).await;
                    reports.push((source, report));
                }
                Err(HubError::ConfigNotFound) => debug!("No workspace, skipping {} servers", source),
                Err(e) => warn!("Cannot load {} servers: {}", source, e),
            }
        }
        reports
    }

    pub async fn restart_connection(&self, name: &str, source: ConfigSource) -> HubResult<Arc<Connection>> {
        self.factory.restart_connection(name, source).await
    }
}

/// Store fields that never need a reconnect on the live record
fn patch(live: &Connection, config: ServerConfig) -> EntryOutcome {
    if live.config() == config {
        return EntryOutcome::Unchanged;
    }
    debug!("Updating settings of '{}' in place", live.name());
    live.set_config(config);
    EntryOutcome::Patched
}
