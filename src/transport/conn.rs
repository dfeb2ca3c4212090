//! Child process connection: spawn, startup handshake, shutdown.
//!
//! The connection owns the server child process and its three stdio pipes.
//! Stderr is tee'd to the parent's stderr and into a bounded [`TailBuffer`]
//! used to enrich error messages. Startup blocks until the server announces
//! readiness by writing the sentinel line to its stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::tail::TailBuffer;
use crate::error::{Error, Result};
use crate::protocol::READY_SENTINEL;

/// Bytes of child stderr retained for error context.
const STDERR_TAIL_LIMIT: usize = 1024;

/// Grace period for the child to exit after its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How to launch the server process.
pub(crate) struct SpawnOptions {
    /// The server executable.
    pub cmd: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment, merged over the parent environment (these win).
    pub env: Vec<(String, String)>,
    /// Working directory for the child.
    pub dir: Option<PathBuf>,
    /// Startup handshake timeout.
    pub timeout: Duration,
}

/// A started connection: the child, both pipe halves, and any frame bytes
/// that arrived in the same reads as the ready sentinel.
pub(crate) struct Conn {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    /// Frame-stream bytes read past the sentinel during the handshake.
    pub leftover: Vec<u8>,
    pub stderr_tail: Arc<TailBuffer>,
    _tee: JoinHandle<()>,
}

/// Launch the child and wait for its ready sentinel.
pub(crate) async fn spawn(opts: &SpawnOptions) -> Result<Conn> {
    let mut cmd = Command::new(&opts.cmd);
    cmd.args(&opts.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, val) in &opts.env {
        cmd.env(key, val);
    }
    if let Some(dir) = &opts.dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|err| Error::StartFailed {
        reason: format!("{}: {err}", opts.cmd),
        stderr: String::new(),
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Protocol("failed to capture server stdin".into()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Protocol("failed to capture server stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Protocol("failed to capture server stderr".into()))?;

    let stderr_tail = Arc::new(TailBuffer::new(STDERR_TAIL_LIMIT));
    let tee = spawn_stderr_tee(stderr, Arc::clone(&stderr_tail));

    let leftover = match wait_for_ready(&mut stdout, opts.timeout).await {
        Ok(leftover) => leftover,
        Err(err) => {
            // Tear down the half-started child before reporting.
            child.kill().await.ok();
            return Err(Error::StartFailed {
                reason: err.to_string(),
                stderr: stderr_tail.contents(),
            });
        }
    };
    debug!(cmd = %opts.cmd, "server is ready");

    Ok(Conn {
        child,
        stdin,
        stdout,
        leftover,
        stderr_tail,
        _tee: tee,
    })
}

/// Read from the child's stdout until the sentinel line appears.
///
/// Everything before the sentinel is discarded; everything after it is
/// returned as the head of the frame stream. The sentinel may arrive split
/// across any number of reads.
pub(crate) async fn wait_for_ready<R>(r: &mut R, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let scan = async {
        let mut seen: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = r.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
            seen.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_sentinel_end(&seen) {
                return Ok(seen.split_off(end));
            }
        }
    };

    match tokio::time::timeout(timeout, scan).await {
        Ok(res) => res,
        Err(_) => Err(Error::TimedOutWaitingForServer),
    }
}

/// Offset just past `_server_started\n` in `buf`, if present.
fn find_sentinel_end(buf: &[u8]) -> Option<usize> {
    let token: Vec<u8> = [READY_SENTINEL, b"\n"].concat();
    buf.windows(token.len())
        .position(|w| w == token)
        .map(|pos| pos + token.len())
}

/// Mirror the child's stderr to the parent's stderr and the tail buffer.
fn spawn_stderr_tee(mut stderr: ChildStderr, tail: Arc<TailBuffer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut out = tokio::io::stderr();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.write(&buf[..n]);
                    let _ = out.write_all(&buf[..n]).await;
                    let _ = out.flush().await;
                }
            }
        }
    })
}

/// Wait for the child to exit after its stdin was closed.
///
/// The server ends itself on EOF; the grace timer just gives it time to do
/// so. A non-zero exit caused by a broken pipe (per the stderr tail) counts
/// as a clean shutdown. On grace expiry the child is left running and an
/// error is returned.
pub(crate) async fn wait_with_grace(child: &mut Child, tail: &TailBuffer) -> Result<()> {
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Err(_) => Err(Error::TimedOutWaitingForExit),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok(status)) => {
            if status.success() || is_broken_pipe(&tail.contents()) {
                Ok(())
            } else {
                Err(Error::Protocol(format!(
                    "server exited with {status}: {tail}"
                )))
            }
        }
    }
}

fn is_broken_pipe(stderr: &str) -> bool {
    stderr.contains("Broken pipe") || stderr.contains("pipe is being closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_sentinel_in_one_read() {
        let (mut tx, mut rx) = duplex(256);
        tx.write_all(b"_server_started\n").await.unwrap();
        let leftover = wait_for_ready(&mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_split_across_reads() {
        let (mut tx, mut rx) = duplex(256);
        let handle = tokio::spawn(async move {
            tx.write_all(b"_server_st").await.unwrap();
            tx.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(b"arted\n").await.unwrap();
            tx
        });
        let leftover = wait_for_ready(&mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(leftover.is_empty());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_noise_before_sentinel_is_discarded() {
        let (mut tx, mut rx) = duplex(256);
        tx.write_all(b"some stray output\n_server_started\n")
            .await
            .unwrap();
        let leftover = wait_for_ready(&mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_bytes_after_sentinel_are_preserved() {
        let (mut tx, mut rx) = duplex(256);
        tx.write_all(b"_server_started\n\x00\x00\x00\x01").await.unwrap();
        let leftover = wait_for_ready(&mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(leftover, vec![0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_timeout_when_no_sentinel() {
        let (_tx, mut rx) = duplex(256);
        let err = wait_for_ready(&mut rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOutWaitingForServer));
    }

    #[tokio::test]
    async fn test_eof_before_sentinel() {
        let (tx, mut rx) = duplex(256);
        drop(tx);
        let err = wait_for_ready(&mut rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }

    #[test]
    fn test_broken_pipe_detection() {
        assert!(is_broken_pipe("write: Broken pipe"));
        assert!(is_broken_pipe("the pipe is being closed"));
        assert!(!is_broken_pipe("segmentation fault"));
    }
}
