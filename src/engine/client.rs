// SPDX-License-Identifier: Apache-2.0

//! Client
//!
//! Registry of live connections keyed by `"<environment>:<database>"`, plus
//! the optional manager of the local query server. The host creates one
//! `Client` and passes it around; nothing here is global.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument};

use sqlbridge_core::split_batches;

use crate::config::EngineConfig;
use crate::engine::connection::{Connection, ConnectionOptions, ConnectionSettings};
use crate::engine::environment::Environment;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::progress::{LogProgress, ProgressIndicator};
use crate::engine::transport::{Connector, TcpConnector};
use crate::engine::types::{RequestId, ResultCallback};
use crate::metrics::{MetricsSnapshot, RequestMetrics};
use crate::server::{ServerProcess, ServerProcessManager};

pub struct Client {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    progress: Arc<dyn ProgressIndicator>,
    metrics: Arc<RequestMetrics>,
    runtime: Handle,
    connections: RwLock<HashMap<String, Connection>>,
    server: Option<ServerProcessManager>,
}

/// Builds a [`Client`] with non-default collaborators
#[derive(Default)]
pub struct ClientBuilder {
    config: EngineConfig,
    connector: Option<Arc<dyn Connector>>,
    progress: Option<Arc<dyn ProgressIndicator>>,
    runtime: Option<Handle>,
}

impl ClientBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressIndicator>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runtime the pollers run on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> EngineResult<Client> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                EngineError::configuration(format!("No tokio runtime available: {e}"))
            })?,
        };

        let server = if self.config.server.manage {
            Some(ServerProcessManager::new(
                self.config.server.clone(),
                self.config.port,
            )?)
        } else {
            None
        };

        Ok(Client {
            settings: ConnectionSettings::from_config(&self.config),
            connector: self.connector.unwrap_or_else(|| Arc::new(TcpConnector)),
            progress: self.progress.unwrap_or_else(|| Arc::new(LogProgress)),
            metrics: Arc::new(RequestMetrics::new()),
            runtime,
            connections: RwLock::new(HashMap::new()),
            server,
        })
    }
}

impl Client {
    /// Client over TCP on the current tokio runtime.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Returns the registered connection for `(env, database)`, creating and
    /// connecting it first if needed. `initial_statements` only apply to a
    /// newly created connection; they are replayed after every handshake and
    /// their responses are discarded.
    #[instrument(skip(self, env, initial_statements), fields(environment = %env.name))]
    pub fn connect(
        &self,
        env: &Environment,
        database: &str,
        initial_statements: &[String],
    ) -> EngineResult<Connection> {
        let key = env.connection_key(database);
        if let Some(existing) = self.connections.read().get(&key) {
            return Ok(existing.clone());
        }

        let connection = Connection::new(
            ConnectionOptions {
                key: key.clone(),
                vendor: env.vendor,
                connection_string: env.connection_string_for(database)?,
                setup_statements: initial_statements.to_vec(),
                settings: self.settings.clone(),
            },
            Arc::clone(&self.connector),
            Arc::clone(&self.progress),
            Arc::clone(&self.metrics),
            self.runtime.clone(),
        );
        connection.connect()?;

        let raced = match self.connections.write().entry(key) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                info!(connection = %entry.key(), "connection registered");
                entry.insert(connection.clone());
                None
            }
        };

        match raced {
            Some(existing) => {
                connection.disconnect();
                Ok(existing)
            }
            None => Ok(connection),
        }
    }

    pub fn connection(&self, env: &Environment, database: &str) -> Option<Connection> {
        self.connections
            .read()
            .get(&env.connection_key(database))
            .cloned()
    }

    /// Removes and closes the connection. Pending callbacks are dropped.
    pub fn disconnect(&self, env: &Environment, database: &str) {
        let removed = self.connections.write().remove(&env.connection_key(database));
        if let Some(connection) = removed {
            info!(connection = %connection.key(), "connection removed");
            connection.reset();
        }
    }

    /// Queues `sql` on the `(env, database)` connection.
    pub fn send(
        &self,
        env: &Environment,
        database: &str,
        sql: &str,
        callback: ResultCallback,
    ) -> EngineResult<RequestId> {
        let connection = self.connect(env, database, &[])?;
        Ok(connection.send(sql, callback))
    }

    /// Splits `lines` on the environment's batch separator and queues them
    /// as one script request. The callback receives the results of every
    /// batch in order.
    pub fn execute_script<S: AsRef<str>>(
        &self,
        env: &Environment,
        database: &str,
        lines: &[S],
        callback: ResultCallback,
    ) -> EngineResult<RequestId> {
        let batches = split_batches(lines, env.batch_separator());
        debug!(environment = %env.name, database, batches = batches.len(), "script split");
        let connection = self.connect(env, database, &[])?;
        Ok(connection.send_script(&batches, callback))
    }

    pub fn reset(&self, env: &Environment, database: &str) {
        if let Some(connection) = self.connection(env, database) {
            connection.reset();
        }
    }

    pub fn reset_all(&self) {
        let connections: Vec<Connection> = self.connections.read().values().cloned().collect();
        for connection in connections {
            connection.reset();
        }
    }

    /// Registered keys, sorted
    pub fn connection_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connections.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Request counters across every connection this client has opened
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn server(&self) -> Option<&ServerProcessManager> {
        self.server.as_ref()
    }

    /// Makes sure the query server is up when server management is enabled.
    pub async fn ensure_server(&self) -> EngineResult<Option<ServerProcess>> {
        match &self.server {
            Some(manager) => manager.ensure_running().await.map(Some),
            None => Ok(None),
        }
    }

    /// Closes every connection and stops a server this client spawned.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> EngineResult<()> {
        let connections: Vec<Connection> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        info!(count = connections.len(), "closing connections");
        for connection in connections {
            connection.reset();
        }

        let totals = self.metrics.snapshot();
        info!(
            completed = totals.completed,
            failed = totals.failed,
            timed_out = totals.timed_out,
            dropped = totals.dropped,
            statement_errors = totals.statement_errors,
            "request totals"
        );

        if let Some(manager) = &self.server {
            manager.stop().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("settings", &self.settings)
            .field("connections", &self.connection_keys())
            .field("server", &self.server)
            .finish()
    }
}
