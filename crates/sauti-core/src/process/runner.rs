//! Child process spawning with cooperative cancellation.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Grace period between the termination signal and the hard kill.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);

/// Boxed future resolving when a started child exits.
pub type WaitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Boxed async reader over one of a child's output pipes.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Handles returned by [`ProcessRunner::start`].
pub struct RunningProcess {
    pub stdout: ByteReader,
    pub stderr: ByteReader,
    /// Resolves when the child exits; a non-zero exit surfaces as an error.
    /// Dropping it without awaiting tears the child down.
    pub wait: WaitFuture,
}

impl std::fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProcess").finish_non_exhaustive()
    }
}

/// Executes child processes. Seam for swapping the real spawner out in
/// tests.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the child to completion under `ctx`, capturing both output
    /// streams in full. A non-zero exit status is an error carrying the
    /// captured stderr.
    async fn run(
        &self,
        ctx: &CancellationToken,
        bin: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Launch the child and return streaming handles plus a wait future.
    /// Cancelling `ctx` terminates the child, which closes both readers.
    async fn start(
        &self,
        ctx: &CancellationToken,
        bin: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<RunningProcess>;
}

/// The production runner, backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

impl TokioRunner {
    fn command(bin: &Path, args: &[String], piped_stdin: bool) -> Command {
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .stdin(if piped_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(
        &self,
        ctx: &CancellationToken,
        bin: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut child = Self::command(bin, args, stdin.is_some()).spawn()?;
        feed_stdin(&mut child, stdin);

        let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr is piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = ctx.cancelled() => None,
        };

        let Some(status) = status else {
            terminate(&mut child).await;
            return Err(Error::Canceled);
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok((stdout, stderr))
        } else {
            Err(Error::ChildFailure {
                reason: exit_reason(status),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
    }

    async fn start(
        &self,
        ctx: &CancellationToken,
        bin: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<RunningProcess> {
        let mut child = Self::command(bin, args, stdin.is_some()).spawn()?;
        feed_stdin(&mut child, stdin);

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let token = ctx.clone();
        let wait: WaitFuture = Box::pin(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status?),
                _ = token.cancelled() => None,
            };
            match status {
                Some(status) if status.success() => Ok(()),
                Some(status) => Err(Error::ChildFailure {
                    reason: exit_reason(status),
                    stderr: String::new(),
                }),
                None => {
                    terminate(&mut child).await;
                    Err(Error::Canceled)
                }
            }
        });

        Ok(RunningProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            wait,
        })
    }
}

/// Write the input to the child's stdin from a background task, closing
/// the pipe when done so the child observes EOF.
fn feed_stdin(child: &mut Child, stdin: Option<Vec<u8>>) {
    if let (Some(input), Some(mut sink)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(err) = sink.write_all(&input).await {
                debug!(error = %err, "failed to write child stdin");
            }
        });
    }
}

fn exit_reason(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Terminate a child: signal first, force-kill after the grace period.
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "child ignored SIGTERM, killing");
    }

    let _ = child.kill().await;
}
