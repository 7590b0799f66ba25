//! Spawning processes and streaming their output.

use conveyor_core::events::LogStream;
use conveyor_core::ports::OutputChunk;
use conveyor_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single process launch.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Bytes written to stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
    /// Keep stdout as the process response instead of logging it.
    pub capture_stdout: bool,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            stdin: None,
            capture_stdout: false,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Finished {
    pub exit_status: i32,
    /// Captured stdout; empty unless requested.
    pub stdout: Vec<u8>,
}

/// Run an invocation to completion, streaming output lines to `output`.
///
/// Cancellation kills the process and returns [`Error::Execution`].
pub async fn execute(
    invocation: Invocation,
    output: &mpsc::Sender<OutputChunk>,
    cancel: &CancellationToken,
) -> Result<Finished> {
    let program = invocation.program.display().to_string();
    debug!(program = %program, args = ?invocation.args, cwd = %invocation.cwd.display(), "Spawning process");

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(&invocation.env)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Execution(format!("failed to spawn {program}: {e}")))?;

    if let (Some(input), Some(mut stdin)) = (invocation.stdin, child.stdin.take()) {
        tokio::spawn(async move {
            // A process that exits without reading its input is not an error.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "stdin closed early");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("stdout not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("stderr not piped".to_string()))?;

    let stdout_task: JoinHandle<Vec<u8>> = if invocation.capture_stdout {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = BufReader::new(stdout);
            if let Err(e) = reader.read_to_end(&mut buf).await {
                warn!(error = %e, "Failed to read stdout");
            }
            buf
        })
    } else {
        let tx = output.clone();
        tokio::spawn(async move {
            forward_lines(stdout, LogStream::Stdout, tx).await;
            Vec::new()
        })
    };
    let stderr_task = tokio::spawn(forward_lines(stderr, LogStream::Stderr, output.clone()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            warn!(program = %program, "Process interrupted");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill process");
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Execution("interrupted".to_string()));
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| Error::Internal(format!("stdout reader failed: {e}")))?;
    stderr_task
        .await
        .map_err(|e| Error::Internal(format!("stderr reader failed: {e}")))?;

    // Killed by a signal.
    let exit_status = status.code().unwrap_or(-1);
    debug!(program = %program, exit_status, "Process exited");

    Ok(Finished {
        exit_status,
        stdout,
    })
}

async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                // Keep draining even if nobody listens, so the process never blocks on a full pipe.
                let _ = tx.send(OutputChunk { stream, line }).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh", std::env::temp_dir()).args(["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_streams_both_streams() {
        let (tx, mut rx) = mpsc::channel(100);
        let finished = execute(sh("echo out; echo err >&2"), &tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);

        assert_eq!(finished.exit_status, 0);
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert!(chunks.contains(&OutputChunk {
            stream: LogStream::Stdout,
            line: "out".to_string()
        }));
        assert!(chunks.contains(&OutputChunk {
            stream: LogStream::Stderr,
            line: "err".to_string()
        }));
    }

    #[tokio::test]
    async fn test_exit_status_and_stdin() {
        let (tx, _rx) = mpsc::channel(100);
        let finished = execute(
            sh("cat; exit 3").stdin(b"hello".to_vec()).capture_stdout(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(finished.exit_status, 3);
        assert_eq!(finished.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let (tx, _rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            execute(sh("sleep 30"), &tx, &cancel),
        )
        .await
        .expect("process was not interrupted");

        assert!(matches!(result, Err(Error::Execution(_))));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let (tx, _rx) = mpsc::channel(100);
        let result = execute(
            Invocation::new("/nonexistent/program", std::env::temp_dir()),
            &tx,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::Execution(_))));
    }
}
