//! Raw client: pending-call table, fan-in reader, timeouts.
//!
//! Raw means no type conversion happens here; frames go out and come back
//! as header plus byte body. [`crate::client::Client`] layers codecs on
//! top.
//!
//! One reader task owns the child's stdout and demultiplexes frames by id
//! into per-call channels; id-0 frames go to the standalone messages
//! channel. Many tasks may call [`RawClient::execute`] concurrently; frame
//! writes are serialized by the write lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{status, FrameBuffer, Header, Message};
use crate::transport::conn::{self, SpawnOptions};
use crate::transport::TailBuffer;

/// Default per-call and startup timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the standalone (id 0) messages channel.
const RAW_MESSAGES_CAPACITY: usize = 10;

/// Options for the raw part of the client.
#[derive(Debug, Default)]
pub struct RawClientOptions {
    /// Protocol version number passed to the server with every request.
    pub version: u16,
    /// The server executable to start.
    pub cmd: String,
    /// Arguments to pass to the command.
    pub args: Vec<String>,
    /// Environment variables for the command, merged with the environment
    /// of the current process; entries here take precedence.
    pub env: Vec<(String, String)>,
    /// Working directory of the command. Empty means the calling process's
    /// current directory.
    pub dir: Option<PathBuf>,
    /// Timeout for server startup and for each call. Defaults to 30 s.
    pub timeout: Option<Duration>,
}

/// One in-flight request, as seen by the reader.
struct PendingCall {
    messages: mpsc::Sender<Message>,
    done: Option<oneshot::Sender<Result<()>>>,
    /// Set when the caller timed out; late frames are discarded instead of
    /// being treated as a protocol violation.
    orphaned: bool,
}

#[derive(Default)]
struct State {
    pending: HashMap<u32, PendingCall>,
    closing: bool,
    shutdown: bool,
}

/// A raw RPC client over a spawned server process.
pub struct RawClient {
    version: u16,
    timeout: Duration,
    seq: AtomicU32,
    // Lock acquisition order: `write` before `state`, always.
    write: Mutex<Option<ChildStdin>>,
    state: Arc<Mutex<State>>,
    child: Mutex<Child>,
    stderr_tail: Arc<TailBuffer>,
    raw_messages: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

impl RawClient {
    /// Start the server process and the reader task.
    pub async fn start(opts: RawClientOptions) -> Result<RawClient> {
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let conn = conn::spawn(&SpawnOptions {
            cmd: opts.cmd,
            args: opts.args,
            env: opts.env,
            dir: opts.dir,
            timeout,
        })
        .await?;

        let (oob_tx, oob_rx) = mpsc::channel(RAW_MESSAGES_CAPACITY);
        let state = Arc::new(Mutex::new(State::default()));

        let reader_state = Arc::clone(&state);
        let stdout = conn.stdout;
        let leftover = conn.leftover;
        tokio::spawn(read_loop(stdout, leftover, reader_state, oob_tx));

        Ok(RawClient {
            version: opts.version,
            timeout,
            seq: AtomicU32::new(0),
            write: Mutex::new(Some(conn.stdin)),
            state,
            child: Mutex::new(conn.child),
            stderr_tail: conn.stderr_tail,
            raw_messages: std::sync::Mutex::new(Some(oob_rx)),
        })
    }

    /// Send a request body and stream every response frame for its id into
    /// `messages`. The final frame delivered is the terminal one; the
    /// channel closes after it.
    ///
    /// Safe to call from many tasks concurrently.
    pub async fn execute(&self, body: Bytes, messages: mpsc::Sender<Message>) -> Result<()> {
        self.execute_with_status(0, body, messages).await
    }

    pub(crate) async fn execute_with_status(
        &self,
        status: u16,
        body: Bytes,
        messages: mpsc::Sender<Message>,
    ) -> Result<()> {
        let (id, done_rx) = {
            let mut state = self.state.lock().await;
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
            let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let (done_tx, done_rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingCall {
                    messages,
                    done: Some(done_tx),
                    orphaned: false,
                },
            );
            (id, done_rx)
        };

        if let Err(err) = self.send_frame(id, status, body).await {
            let mut state = self.state.lock().await;
            state.pending.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, done_rx).await {
            Ok(Ok(result)) => result,
            // Reader dropped the done signal without answering; the
            // connection is gone.
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                // Leave the entry in the table marked orphaned so the
                // reader can discard whatever the server still sends.
                let mut state = self.state.lock().await;
                if let Some(call) = state.pending.get_mut(&id) {
                    call.orphaned = true;
                }
                Err(Error::TimedOutWaitingForCall)
            }
        }
    }

    async fn send_frame(&self, id: u32, status: u16, body: Bytes) -> Result<()> {
        let mut write = self.write.lock().await;
        {
            let state = self.state.lock().await;
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
        }
        let writer = write.as_mut().ok_or(Error::Shutdown)?;
        let msg = Message::new(Header::new(id, self.version, status), body);
        msg.write(writer).await
    }

    /// Take the receiver for standalone (id 0) messages from the server,
    /// e.g. log lines. Yields `None` after the first call.
    pub fn take_raw_messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.raw_messages.lock().unwrap().take()
    }

    /// Tail of the server's stderr, for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.contents()
    }

    /// Close the connection and wait for the server process to quit.
    ///
    /// Closing the write half signals EOF to the server, which ends itself.
    /// A second close returns [`Error::Shutdown`]. In-flight calls observe
    /// a shutdown error.
    pub async fn close(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        {
            let mut state = self.state.lock().await;
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        write.take();

        let mut child = self.child.lock().await;
        conn::wait_with_grace(&mut child, &self.stderr_tail).await
    }
}

/// Reader task: demultiplex frames into per-call channels until the stream
/// ends, then fail whatever is still pending.
async fn read_loop<Rd>(
    mut reader: Rd,
    leftover: Vec<u8>,
    state: Arc<Mutex<State>>,
    oob: mpsc::Sender<Message>,
) where
    Rd: tokio::io::AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_leftover(&leftover);
    let mut chunk = vec![0u8; 64 * 1024];

    let err: Error = 'read: {
        // The handshake may have read complete frames past the sentinel.
        if let Err(err) = drain(&mut frames, &[], &state, &oob).await {
            break 'read err;
        }
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break 'read Error::Eof,
                Ok(n) => n,
                Err(err) => break 'read err.into(),
            };
            if let Err(err) = drain(&mut frames, &chunk[..n], &state, &oob).await {
                break 'read err;
            }
        }
    };

    // Terminate pending calls.
    let mut state = state.lock().await;
    state.shutdown = true;
    let err = match err {
        Error::Eof => {
            if state.closing {
                Error::Shutdown
            } else {
                Error::UnexpectedEof
            }
        }
        other => other,
    };
    if !matches!(err, Error::Shutdown) {
        warn!(%err, "reader stopped");
    }
    for (_, mut call) in state.pending.drain() {
        if let Some(done) = call.done.take() {
            let _ = done.send(Err(shareable(&err)));
        }
    }
}

/// Extract and route every complete frame after appending `data`.
async fn drain(
    frames: &mut FrameBuffer,
    data: &[u8],
    state: &Arc<Mutex<State>>,
    oob: &mpsc::Sender<Message>,
) -> Result<()> {
    for frame in frames.push(data)? {
        dispatch_frame(frame, state, oob).await?;
    }
    Ok(())
}

/// Route one frame. An unknown id is a protocol violation and fatal; a
/// known-but-orphaned id (timed-out call) is dropped silently.
async fn dispatch_frame(
    msg: Message,
    state: &Arc<Mutex<State>>,
    oob: &mpsc::Sender<Message>,
) -> Result<()> {
    if msg.header.id == 0 {
        // Standalone message, not part of any request/response flow.
        let _ = oob.send(msg).await;
        return Ok(());
    }

    let mut state = state.lock().await;
    let id = msg.header.id;
    let Some(call) = state.pending.get_mut(&id) else {
        return Err(Error::Protocol(format!("call with id {id} not found")));
    };

    if msg.header.status == status::CONTINUE {
        if call.orphaned {
            debug!(id, "dropping frame for timed-out call");
        } else {
            let _ = call.messages.send(msg).await;
        }
        return Ok(());
    }

    // Terminal frame: deliver while still holding the state lock, then
    // clear the entry.
    if call.orphaned {
        debug!(id, "dropping terminal frame for timed-out call");
    } else {
        let _ = call.messages.send(msg).await;
    }
    let mut call = state.pending.remove(&id).expect("entry looked up above");
    if let Some(done) = call.done.take() {
        let _ = done.send(Ok(()));
    }
    Ok(())
}

/// Errors fan out to every pending call; most variants do not implement
/// `Clone`, so collapse the rest to their message.
fn shareable(err: &Error) -> Error {
    match err {
        Error::Shutdown => Error::Shutdown,
        Error::UnexpectedEof => Error::UnexpectedEof,
        other => Error::Protocol(other.to_string()),
    }
}
