//! Subprocess I/O pipeline.
//!
//! Runs one git service process per exec request and wires three concurrent
//! byte-stream copies: client → stdin, stdout → client, stderr → client's
//! error stream. The completion barrier covers only the two outbound copies;
//! the stdin copy is deliberately excluded so a client that keeps sending
//! input cannot block exit detection.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::GitCommand;
use crate::error::{Error, Result};

/// Copy buffer size for the outbound streams.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Capacity of the client → stdin queue, in messages.
const STDIN_QUEUE_DEPTH: usize = 64;

/// Where pipeline output lands on the client side.
///
/// The production implementation wraps an SSH channel handle; tests use an
/// in-memory collector. Send failures mean the client is gone, which stops
/// the affected copy but never the process wait.
#[async_trait::async_trait]
pub trait ChannelSink: Send + Sync {
    /// Subprocess stdout bytes.
    async fn data(&self, data: &[u8]) -> io::Result<()>;
    /// Subprocess stderr bytes (the channel's distinct error stream).
    async fn error_data(&self, data: &[u8]) -> io::Result<()>;
    /// Exit-status notification, sent once after the process exits.
    async fn exit_status(&self, code: u32);
    /// End of the logical channel: EOF then close.
    async fn finish(&self);
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The subprocess exited on its own with this code.
    Exited(u32),
    /// The session was cancelled and the subprocess was killed.
    Cancelled,
}

/// A started pipeline.
///
/// Dropping the handle detaches the driver task; the subprocess keeps running
/// until it exits or the cancellation token fires.
pub struct PipelineHandle {
    /// Feed for the client → stdin copy. Drop every sender to signal EOF to
    /// the subprocess.
    pub stdin: mpsc::Sender<Vec<u8>>,
    /// Completion of the driver task, for callers that want the outcome.
    pub completion: JoinHandle<Result<ExitOutcome>>,
}

/// Build the subprocess invocation for a validated command.
///
/// The environment is set exactly to the session's accumulated sequence; the
/// ambient server environment is never inherited, so server secrets cannot
/// leak into git hooks. For duplicate names the first occurrence wins, which
/// is what `execve` does with a duplicated envp.
pub fn service_command(
    command: &GitCommand,
    env: &[String],
    repository_root: &Path,
    git_bin_dir: Option<&Path>,
) -> Command {
    let program = match git_bin_dir {
        Some(dir) => dir.join(command.service.program()).into_os_string(),
        None => command.service.program().into(),
    };
    let mut cmd = Command::new(program);
    cmd.arg(&command.repository);
    cmd.current_dir(repository_root);
    cmd.env_clear();
    let mut seen = HashSet::new();
    for entry in env {
        let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        if seen.insert(name.to_string()) {
            cmd.env(name, value);
        }
    }
    cmd
}

/// Spawn the subprocess and start the three copy tasks plus the driver.
///
/// Returns as soon as the process is confirmed started, so the caller can
/// acknowledge the exec request before any output flows. The driver task then
/// waits on the outbound barrier, reaps the process, and sends the real exit
/// status followed by EOF and close on the sink.
pub fn start(
    mut command: Command,
    sink: Arc<dyn ChannelSink>,
    cancel: CancellationToken,
) -> Result<PipelineHandle> {
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(Error::ProcessSpawn)?;

    let pipe_err = || Error::Pipe(io::Error::other("subprocess pipe missing"));
    let mut stdin = child.stdin.take().ok_or_else(pipe_err)?;
    let stdout = child.stdout.take().ok_or_else(pipe_err)?;
    let stderr = child.stderr.take().ok_or_else(pipe_err)?;

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE_DEPTH);

    // Copy (1): client → stdin. Ends on client EOF (all senders dropped) or
    // write failure; dropping the handle closes the pipe either way.
    let stdin_task = tokio::spawn(async move {
        while let Some(buf) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(&buf).await {
                debug!(error = %e, "stdin copy ended (process may have exited)");
                break;
            }
        }
    });

    // Copies (2) and (3): stdout and stderr → client.
    let out_sink = Arc::clone(&sink);
    let mut stdout_task =
        tokio::spawn(async move { copy_to_sink(stdout, out_sink, OutboundStream::Data).await });
    let err_sink = Arc::clone(&sink);
    let mut stderr_task =
        tokio::spawn(async move { copy_to_sink(stderr, err_sink, OutboundStream::Error).await });

    let completion = tokio::spawn(async move {
        // Barrier over the two outbound copies only.
        let barrier = async {
            let (out, err) = tokio::join!(&mut stdout_task, &mut stderr_task);
            for res in [out, err] {
                match res {
                    Ok(Err(e)) => warn!(error = %e, "output copy failed"),
                    Err(e) => warn!(error = %e, "output copy task panicked"),
                    Ok(Ok(())) => {}
                }
            }
        };
        tokio::select! {
            () = barrier => {}
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                stdin_task.abort();
                sink.finish().await;
                return Ok(ExitOutcome::Cancelled);
            }
        }

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(Error::Pipe)?;
                ExitOutcome::Exited(status.code().unwrap_or(1) as u32)
            }
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                ExitOutcome::Cancelled
            }
        };

        // The client may still be sending; release the stdin pipe here so no
        // handle outlives the process on any exit path.
        stdin_task.abort();

        if let ExitOutcome::Exited(code) = outcome {
            sink.exit_status(code).await;
        }
        sink.finish().await;
        Ok(outcome)
    });

    Ok(PipelineHandle {
        stdin: stdin_tx,
        completion,
    })
}

/// Which side of the logical channel an outbound copy feeds.
#[derive(Clone, Copy)]
enum OutboundStream {
    Data,
    Error,
}

async fn copy_to_sink<R>(
    mut reader: R,
    sink: Arc<dyn ChannelSink>,
    stream: OutboundStream,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        match stream {
            OutboundStream::Data => sink.data(&buf[..n]).await?,
            OutboundStream::Error => sink.error_data(&buf[..n]).await?,
        }
    }
}
