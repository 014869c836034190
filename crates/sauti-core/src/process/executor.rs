//! Timeout-bounded execution and line-chunked streaming over one binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::StreamChunk;
use crate::error::{Error, Result};
use crate::process::runner::{ProcessRunner, RunningProcess, TokioRunner};

/// Executes a single binary either to completion or as a chunk stream.
///
/// The binary path is verified to exist at construction time so a
/// misconfigured backend fails fast instead of on the first request.
pub struct Executor {
    bin: PathBuf,
    timeout: Duration,
    runner: Arc<dyn ProcessRunner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("bin", &self.bin)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor for `bin` with a default per-invocation timeout.
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let bin = bin.into();
        if !bin.exists() {
            return Err(Error::BinaryNotFound(bin));
        }
        Ok(Self {
            bin,
            timeout,
            runner: Arc::new(TokioRunner),
        })
    }

    /// Create an executor with an injected runner. Skips the existence
    /// check; intended for tests.
    pub fn with_runner(
        bin: impl Into<PathBuf>,
        timeout: Duration,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            bin: bin.into(),
            timeout,
            runner,
        }
    }

    /// Run the binary to completion, returning `(stdout, stderr)`.
    ///
    /// The invocation runs under a timeout-bounded scope derived from
    /// `ctx`; expiry yields [`Error::DeadlineExceeded`], distinct from a
    /// child's own non-zero exit.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let scoped = ctx.child_token();
        let run = self.runner.run(&scoped, &self.bin, args, stdin);
        tokio::pin!(run);

        tokio::select! {
            res = &mut run => res,
            _ = tokio::time::sleep(self.timeout) => {
                scoped.cancel();
                Err(Error::DeadlineExceeded)
            }
        }
    }

    /// Launch the binary and stream its stdout line by line.
    ///
    /// Each line (delimiter retained) becomes one data chunk; the stream
    /// always ends with exactly one terminal chunk. Chunks arrive in the
    /// order the child produced them. Start failures fail synchronously.
    pub async fn stream(
        &self,
        ctx: &CancellationToken,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let proc = self
            .runner
            .start(ctx, &self.bin, args, stdin)
            .await
            .map_err(|err| Error::StartupFailure {
                name: self.bin.display().to_string(),
                reason: format!("failed to start command: {err}"),
            })?;

        // Capacity 1 so the pump backpressures against slow consumers.
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump_lines(proc, tx, ctx.clone()));
        Ok(rx)
    }
}

async fn pump_lines(
    proc: RunningProcess,
    tx: mpsc::Sender<StreamChunk>,
    ctx: CancellationToken,
) {
    let RunningProcess {
        stdout,
        mut stderr,
        wait,
    } = proc;
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = ctx.cancelled() => {
                let _ = tx.send(StreamChunk::failed(Error::Canceled)).await;
                return;
            }
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(StreamChunk::data(line.clone())).await.is_err() {
                    // Consumer hung up; dropping `wait` tears the child down.
                    debug!("stream consumer dropped, abandoning child output");
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(StreamChunk::failed(err.into())).await;
                return;
            }
        }
    }

    // EOF: keep the stderr tail for diagnostics, then surface the exit.
    let mut tail = Vec::new();
    let _ = stderr.read_to_end(&mut tail).await;
    let chunk = match wait.await {
        Ok(()) => StreamChunk::done(),
        Err(Error::ChildFailure { reason, .. }) => StreamChunk::failed(Error::ChildFailure {
            reason,
            stderr: String::from_utf8_lossy(&tail).into_owned(),
        }),
        Err(err) => StreamChunk::failed(err),
    };
    let _ = tx.send(chunk).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::runner::WaitFuture;

    use std::path::Path;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use tokio::io::AsyncRead;

    type RunFn = dyn Fn() -> Result<(Vec<u8>, Vec<u8>)> + Send + Sync;

    /// Test double with canned behaviour per mode.
    struct MockRunner {
        run: Option<Box<RunFn>>,
        start: Option<Box<dyn Fn() -> Result<RunningProcess> + Send + Sync>>,
        block_run_on_ctx: bool,
    }

    impl MockRunner {
        fn running(f: impl Fn() -> Result<(Vec<u8>, Vec<u8>)> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                run: Some(Box::new(f)),
                start: None,
                block_run_on_ctx: false,
            })
        }

        fn starting(f: impl Fn() -> Result<RunningProcess> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                run: None,
                start: Some(Box::new(f)),
                block_run_on_ctx: false,
            })
        }

        fn blocking() -> Arc<Self> {
            Arc::new(Self {
                run: None,
                start: None,
                block_run_on_ctx: true,
            })
        }
    }

    #[async_trait]
    impl ProcessRunner for MockRunner {
        async fn run(
            &self,
            ctx: &CancellationToken,
            _bin: &Path,
            _args: &[String],
            _stdin: Option<Vec<u8>>,
        ) -> Result<(Vec<u8>, Vec<u8>)> {
            if self.block_run_on_ctx {
                ctx.cancelled().await;
                return Err(Error::Canceled);
            }
            (self.run.as_ref().expect("run configured"))()
        }

        async fn start(
            &self,
            _ctx: &CancellationToken,
            _bin: &Path,
            _args: &[String],
            _stdin: Option<Vec<u8>>,
        ) -> Result<RunningProcess> {
            (self.start.as_ref().expect("start configured"))()
        }
    }

    /// Reader that never yields data and never finishes.
    struct PendingReader;

    impl AsyncRead for PendingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    fn process(stdout: &'static [u8], stderr: &'static [u8], wait: WaitFuture) -> RunningProcess {
        RunningProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            wait,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn new_rejects_nonexistent_binary() {
        let err = Executor::new("/nonexistent/binary", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn execute_returns_both_streams() {
        let runner = MockRunner::running(|| Ok((b"output".to_vec(), Vec::new())));
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(1), runner);

        let (stdout, stderr) = ex
            .execute(&CancellationToken::new(), &[], None)
            .await
            .unwrap();
        assert_eq!(stdout, b"output");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn execute_propagates_child_failure() {
        let runner = MockRunner::running(|| {
            Err(Error::ChildFailure {
                reason: "exit status 1".into(),
                stderr: "error".into(),
            })
        });
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(1), runner);

        let err = ex
            .execute(&CancellationToken::new(), &[], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit status 1"));
        assert!(err.to_string().contains("error"));
    }

    #[tokio::test]
    async fn execute_times_out_against_blocked_runner() {
        let ex = Executor::with_runner(
            "/bin/test",
            Duration::from_millis(10),
            MockRunner::blocking(),
        );

        let err = ex
            .execute(&CancellationToken::new(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn stream_emits_lines_in_order_then_done() {
        let runner = MockRunner::starting(|| {
            Ok(process(
                b"line1\nline2\nline3\n",
                b"",
                Box::pin(async { Ok(()) }),
            ))
        });
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(1), runner);

        let rx = ex.stream(&CancellationToken::new(), &[], None).await.unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].data, b"line1\n");
        assert_eq!(chunks[1].data, b"line2\n");
        assert_eq!(chunks[2].data, b"line3\n");
        assert!(chunks[3].done);
        assert!(chunks[3].error.is_none());

        let joined: Vec<u8> = chunks[..3].iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(joined, b"line1\nline2\nline3\n");
    }

    #[tokio::test]
    async fn stream_terminal_carries_exit_error_and_stderr_tail() {
        let runner = MockRunner::starting(|| {
            Ok(process(
                b"output\n",
                b"error message",
                Box::pin(async {
                    Err(Error::ChildFailure {
                        reason: "exit status 1".into(),
                        stderr: String::new(),
                    })
                }),
            ))
        });
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(1), runner);

        let rx = ex.stream(&CancellationToken::new(), &[], None).await.unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, b"output\n");
        assert!(chunks[1].done);
        let err = chunks[1].error.as_ref().expect("terminal error");
        assert!(err.to_string().contains("exit status 1"));
        assert!(err.to_string().contains("error message"));
    }

    #[tokio::test]
    async fn stream_start_failure_is_synchronous() {
        let runner = MockRunner::starting(|| {
            Err(Error::Io(std::io::Error::other("cannot start")))
        });
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(1), runner);

        let err = ex
            .stream(&CancellationToken::new(), &[], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start command"));
    }

    #[tokio::test]
    async fn stream_empty_output_yields_single_terminal() {
        let runner =
            MockRunner::starting(|| Ok(process(b"", b"", Box::pin(async { Ok(()) }))));
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(1), runner);

        let rx = ex.stream(&CancellationToken::new(), &[], None).await.unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert!(chunks[0].error.is_none());
    }

    #[tokio::test]
    async fn stream_with_cancelled_scope_emits_cancellation_terminal() {
        let runner = MockRunner::starting(|| {
            Ok(RunningProcess {
                stdout: Box::new(PendingReader),
                stderr: Box::new(&b""[..]),
                wait: Box::pin(async { Ok(()) }),
            })
        });
        let ex = Executor::with_runner("/bin/test", Duration::from_secs(5), runner);

        let ctx = CancellationToken::new();
        ctx.cancel();

        let rx = ex.stream(&ctx, &[], None).await.unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert!(matches!(chunks[0].error, Some(Error::Canceled)));
    }

    #[tokio::test]
    async fn stream_cancellation_mid_flight_terminates_within_bound() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let reader: std::sync::Mutex<Option<_>> = std::sync::Mutex::new(Some(reader));
        let runner = Arc::new(MockDuplexRunner { reader });

        let ex = Executor::with_runner("/bin/test", Duration::from_secs(5), runner);
        let ctx = CancellationToken::new();

        let mut rx = ex.stream(&ctx, &[], None).await.unwrap();

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"line1\n").await.unwrap();

        let first = rx.recv().await.expect("first chunk");
        assert_eq!(first.data, b"line1\n");

        ctx.cancel();
        let last = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("terminal within bound")
            .expect("terminal chunk");
        assert!(last.done);
        assert!(matches!(last.error, Some(Error::Canceled)));
        assert!(rx.recv().await.is_none());
    }

    /// One-shot runner handing out a duplex read end.
    struct MockDuplexRunner {
        reader: std::sync::Mutex<Option<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl ProcessRunner for MockDuplexRunner {
        async fn run(
            &self,
            _ctx: &CancellationToken,
            _bin: &Path,
            _args: &[String],
            _stdin: Option<Vec<u8>>,
        ) -> Result<(Vec<u8>, Vec<u8>)> {
            unimplemented!("stream-only mock")
        }

        async fn start(
            &self,
            _ctx: &CancellationToken,
            _bin: &Path,
            _args: &[String],
            _stdin: Option<Vec<u8>>,
        ) -> Result<RunningProcess> {
            let reader = self.reader.lock().unwrap().take().expect("single start");
            Ok(RunningProcess {
                stdout: Box::new(reader),
                stderr: Box::new(&b""[..]),
                wait: Box::pin(async { Ok(()) }),
            })
        }
    }
}
