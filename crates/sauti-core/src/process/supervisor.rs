//! Process-wide pool of long-running child HTTP servers.
//!
//! Backends ask the supervisor to start their child server on demand; the
//! supervisor owns every child handle, gates readiness on the child's
//! health endpoint, reaps crashed children so the next request can
//! respawn, and stops everything on shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::runner::{terminate, KILL_GRACE};

const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const STDERR_TAIL_LIMIT: usize = 8 * 1024;

/// Everything needed to launch one child server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub bin: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub health_path: String,
}

type Key = (String, u16);

struct ServerHandle {
    id: u64,
    stop: CancellationToken,
    done: watch::Receiver<bool>,
    #[allow(dead_code)]
    started_at: Instant,
}

/// Supervisor for child servers keyed by `(name, port)`.
pub struct ServerSupervisor {
    servers: Arc<Mutex<HashMap<Key, ServerHandle>>>,
    client: reqwest::Client,
    readiness_timeout: Duration,
    next_id: AtomicU64,
}

impl Default for ServerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSupervisor {
    pub fn new() -> Self {
        Self {
            servers: Arc::new(Mutex::new(HashMap::new())),
            client: reqwest::Client::new(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            next_id: AtomicU64::new(0),
        }
    }

    /// Override the readiness window. Mostly useful in tests.
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Ensure a child server for `(spec.name, spec.port)` is running.
    ///
    /// Returns immediately when a live handle already exists. Otherwise
    /// spawns the child and polls its health endpoint until a 2xx is
    /// observed. A child that exits before readiness surfaces its stderr;
    /// a child that never becomes healthy is stopped and reported as a
    /// timeout, leaving the pool clean for a retry.
    pub async fn start_server(&self, ctx: &CancellationToken, spec: ServerSpec) -> Result<()> {
        let key = (spec.name.clone(), spec.port);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let exited = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(String::new()));

        // Check-and-spawn under one lock scope so concurrent starts for
        // the same (name, port) cannot double-spawn. Spawning itself does
        // not block.
        let mut child = {
            let mut servers = self.servers.lock().expect("supervisor lock poisoned");
            if servers.contains_key(&key) {
                return Ok(());
            }

            info!(name = %spec.name, port = spec.port, bin = %spec.bin.display(), "starting server");
            let child = Command::new(&spec.bin)
                .args(&spec.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| Error::StartupFailure {
                    name: spec.name.clone(),
                    reason: err.to_string(),
                })?;

            servers.insert(
                key.clone(),
                ServerHandle {
                    id,
                    stop: stop.clone(),
                    done: done_rx,
                    started_at: Instant::now(),
                },
            );
            child
        };

        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().expect("stderr tail lock poisoned");
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_LIMIT {
                        let cut = tail.len() - STDERR_TAIL_LIMIT;
                        tail.drain(..cut);
                    }
                }
            });
        }

        // Per-handle watcher: reaps the child on crash so the next call
        // may respawn, or tears it down on an explicit stop.
        {
            let servers = Arc::clone(&self.servers);
            let key = key.clone();
            let name = spec.name.clone();
            let stop = stop.clone();
            let exited = Arc::clone(&exited);
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = stop.cancelled() => None,
                };
                match status {
                    Some(status) => {
                        exited.store(true, Ordering::SeqCst);
                        warn!(name = %name, ?status, "server exited unexpectedly");
                        let mut servers = servers.lock().expect("supervisor lock poisoned");
                        if servers.get(&key).is_some_and(|h| h.id == id) {
                            servers.remove(&key);
                        }
                    }
                    None => {
                        terminate(&mut child).await;
                        exited.store(true, Ordering::SeqCst);
                        debug!(name = %name, "server stopped");
                    }
                }
                let _ = done_tx.send(true);
            });
        }

        // Readiness probe, deliberately outside the table lock so starts
        // for different (name, port) pairs proceed in parallel.
        self.wait_ready(ctx, &spec, id, &exited, &stderr_tail).await
    }

    async fn wait_ready(
        &self,
        ctx: &CancellationToken,
        spec: &ServerSpec,
        id: u64,
        exited: &AtomicBool,
        stderr_tail: &Mutex<String>,
    ) -> Result<()> {
        let url = format!("http://127.0.0.1:{}{}", spec.port, spec.health_path);
        let deadline = Instant::now() + self.readiness_timeout;

        loop {
            if exited.load(Ordering::SeqCst) {
                self.remove_if(&(spec.name.clone(), spec.port), id);
                let tail = stderr_tail.lock().expect("stderr tail lock poisoned").clone();
                let reason = if tail.trim().is_empty() {
                    "process exited before becoming ready".to_string()
                } else {
                    tail
                };
                return Err(Error::StartupFailure {
                    name: spec.name.clone(),
                    reason,
                });
            }

            let probe = self
                .client
                .get(&url)
                .timeout(HEALTH_REQUEST_TIMEOUT)
                .send()
                .await;
            if let Ok(resp) = probe {
                if resp.status().is_success() {
                    info!(name = %spec.name, port = spec.port, "server ready");
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                // Leave the pool clean so a later request can retry.
                self.stop_server(&spec.name, spec.port).await?;
                return Err(Error::StartupTimeout {
                    name: spec.name.clone(),
                    port: spec.port,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = ctx.cancelled() => return Err(Error::Canceled),
            }
        }
    }

    fn remove_if(&self, key: &Key, id: u64) {
        let mut servers = self.servers.lock().expect("supervisor lock poisoned");
        if servers.get(key).is_some_and(|h| h.id == id) {
            servers.remove(key);
        }
    }

    /// Stop the server for `(name, port)` and remove its handle.
    /// Idempotent: stopping an unknown key is a no-op.
    pub async fn stop_server(&self, name: &str, port: u16) -> Result<()> {
        let handle = {
            let mut servers = self.servers.lock().expect("supervisor lock poisoned");
            servers.remove(&(name.to_string(), port))
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        handle.stop.cancel();
        let mut done = handle.done.clone();
        let _ = tokio::time::timeout(KILL_GRACE + Duration::from_secs(2), async {
            let _ = done.wait_for(|reaped| *reaped).await;
        })
        .await;

        info!(name, port, "server stopped");
        Ok(())
    }

    /// Stop every tracked server concurrently.
    pub async fn stop_all(&self) {
        let handles: Vec<(Key, ServerHandle)> = {
            let mut servers = self.servers.lock().expect("supervisor lock poisoned");
            servers.drain().collect()
        };

        let stops = handles.into_iter().map(|((name, port), handle)| async move {
            handle.stop.cancel();
            let mut done = handle.done.clone();
            let _ = tokio::time::timeout(KILL_GRACE + Duration::from_secs(2), async {
                let _ = done.wait_for(|reaped| *reaped).await;
            })
            .await;
            debug!(name = %name, port, "server stopped during shutdown");
        });
        futures::future::join_all(stops).await;
    }

    /// Number of live handles. Exposed for tests and introspection.
    pub fn server_count(&self) -> usize {
        self.servers.lock().expect("supervisor lock poisoned").len()
    }
}
