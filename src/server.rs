// SPDX-License-Identifier: Apache-2.0

//! Query server lifecycle
//!
//! The engine talks to a long-running server process on a local TCP port.
//! [`ServerProcessManager`] finds an already running instance (by asking the
//! OS which process listens on the port) or launches one, and tracks at most
//! one process at a time.
//!
//! Only processes this manager spawned are ever terminated; a discovered
//! server belongs to someone else and is merely forgotten on `stop`.

pub mod discovery;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::ServerConfig;
use crate::engine::error::{EngineError, EngineResult};

const LOCALHOST: &str = "127.0.0.1";
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOrigin {
    /// Found listening on the port; not ours to kill
    Discovered,
    /// Launched by this manager
    Spawned,
}

/// The server process currently tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerProcess {
    pub pid: u32,
    pub origin: ProcessOrigin,
}

struct Tracked {
    process: ServerProcess,
    watcher: Option<Watcher>,
}

/// Task owning a spawned child until it exits or is told to kill it
struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ServerProcessManager {
    config: ServerConfig,
    port: u16,
    discovery_tool: PathBuf,
    tracked: Arc<Mutex<Option<Tracked>>>,
}

impl ServerProcessManager {
    /// Fails with `DiscoveryToolMissing` when the lookup tool is not on
    /// `PATH`.
    pub fn new(config: ServerConfig, port: u16) -> EngineResult<Self> {
        let discovery_tool = discovery::find_in_path(&config.discovery_tool)
            .ok_or_else(|| EngineError::discovery_tool_missing(config.discovery_tool.clone()))?;

        Ok(Self {
            config,
            port,
            discovery_tool,
            tracked: Arc::new(Mutex::new(None)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn current(&self) -> Option<ServerProcess> {
        self.tracked.lock().as_ref().map(|tracked| tracked.process)
    }

    /// Pid of whatever listens on the port right now.
    pub async fn discover(&self) -> EngineResult<Option<u32>> {
        discovery::listening_pid(&self.discovery_tool, self.port).await
    }

    /// Returns the tracked server, or adopts a running one, or launches the
    /// configured binary and waits for it to accept connections.
    #[instrument(skip(self), fields(port = self.port))]
    pub async fn ensure_running(&self) -> EngineResult<ServerProcess> {
        if let Some(process) = self.current() {
            return Ok(process);
        }

        if let Some(pid) = self.discover().await? {
            info!(pid, "adopting running query server");
            let process = ServerProcess {
                pid,
                origin: ProcessOrigin::Discovered,
            };
            *self.tracked.lock() = Some(Tracked {
                process,
                watcher: None,
            });
            return Ok(process);
        }

        let binary = self.config.binary_path.clone().ok_or_else(|| {
            EngineError::configuration(format!(
                "No query server on port {} and no server binary configured",
                self.port
            ))
        })?;

        let pid = self.spawn(&binary, &self.config.log_path).await?;
        if let Err(e) = self.wait_until_listening(self.config.startup_timeout()).await {
            warn!(pid, error = %e, "query server did not come up; stopping it");
            self.stop().await?;
            return Err(e);
        }

        Ok(ServerProcess {
            pid,
            origin: ProcessOrigin::Spawned,
        })
    }

    /// Launches `<binary> -p <port>` with stdout and stderr appended to
    /// `log_path`, replacing whatever was tracked before.
    #[instrument(skip(self), fields(port = self.port))]
    pub async fn spawn(&self, binary: &Path, log_path: &Path) -> EngineResult<u32> {
        let log = open_log(log_path, binary, self.port)?;
        let stderr = log
            .try_clone()
            .map_err(|e| EngineError::spawn_failed(format!("Failed to share log file: {e}")))?;

        let child = Command::new(binary)
            .arg("-p")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::spawn_failed(format!("Failed to launch {}: {}", binary.display(), e))
            })?;

        let pid = child.id().ok_or_else(|| {
            EngineError::spawn_failed(format!("{} exited immediately", binary.display()))
        })?;
        info!(pid, binary = %binary.display(), log = %log_path.display(), "query server launched");

        // Hold the slot while the watcher starts so an instant exit cannot
        // clear it before the new process is recorded.
        let previous = {
            let mut slot = self.tracked.lock();
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(watch(child, pid, cancel.clone(), Arc::clone(&self.tracked)));
            slot.replace(Tracked {
                process: ServerProcess {
                    pid,
                    origin: ProcessOrigin::Spawned,
                },
                watcher: Some(Watcher { cancel, handle }),
            })
        };
        if let Some(previous) = previous {
            retire(previous).await;
        }

        Ok(pid)
    }

    /// Polls the port until it accepts a TCP connection. Fails early if the
    /// spawned process exits meanwhile.
    pub async fn wait_until_listening(&self, limit: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            let attempt = timeout(PROBE_INTERVAL, TcpStream::connect((LOCALHOST, self.port))).await;
            if let Ok(Ok(_)) = attempt {
                return Ok(());
            }
            if self.current().is_none() {
                return Err(EngineError::spawn_failed(format!(
                    "query server exited before listening on port {}",
                    self.port
                )));
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    /// Terminates a spawned server and waits for it to exit. A discovered
    /// server is forgotten, not killed.
    #[instrument(skip(self), fields(port = self.port))]
    pub async fn stop(&self) -> EngineResult<()> {
        let Some(tracked) = self.tracked.lock().take() else {
            return Ok(());
        };

        match tracked.process.origin {
            ProcessOrigin::Discovered => {
                info!(pid = tracked.process.pid, "forgetting discovered query server");
            }
            ProcessOrigin::Spawned => {
                info!(pid = tracked.process.pid, "stopping query server");
            }
        }
        retire(tracked).await;
        Ok(())
    }
}

impl std::fmt::Debug for ServerProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcessManager")
            .field("port", &self.port)
            .field("discovery_tool", &self.discovery_tool)
            .field("current", &self.current())
            .finish()
    }
}

async fn watch(
    mut child: Child,
    pid: u32,
    cancel: CancellationToken,
    tracked: Arc<Mutex<Option<Tracked>>>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(pid, %status, "query server exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait for query server"),
            }
            let mut slot = tracked.lock();
            if slot.as_ref().map(|t| t.process.pid) == Some(pid) {
                *slot = None;
            }
        }
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill query server");
            }
        }
    }
}

async fn retire(tracked: Tracked) {
    if let Some(watcher) = tracked.watcher {
        watcher.cancel.cancel();
        if let Err(e) = watcher.handle.await {
            warn!(pid = tracked.process.pid, error = %e, "query server watcher failed");
        }
    }
}

fn open_log(path: &Path, binary: &Path, port: u16) -> EngineResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            EngineError::spawn_failed(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            EngineError::spawn_failed(format!("Failed to open {}: {}", path.display(), e))
        })?;

    writeln!(
        file,
        "==== {} starting {} -p {} ====",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        binary.display(),
        port
    )
    .map_err(|e| EngineError::spawn_failed(format!("Failed to write {}: {}", path.display(), e)))?;

    Ok(file)
}
