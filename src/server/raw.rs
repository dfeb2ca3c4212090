//! Raw server loop (child side).
//!
//! Reads frames from stdin and hands each to the configured call hook,
//! together with the shared [`Dispatcher`]. All outbound frames funnel
//! through the dispatcher, which serializes writers with a mutex; a write
//! failure there is fatal for the whole connection.
//!
//! See [`crate::server::Server`] for the typed layer on top.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::stdio;
use crate::error::{Error, Result};
use crate::protocol::{Message, READY_SENTINEL};

/// Boxed future returned by handler hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-message hook: the full request/reply exchange for one inbound frame.
///
/// Any error returned here is fatal and stops the server. Validation
/// problems should be answered with error-status frames instead. Frames
/// sent back as part of a request/response exchange must reuse the request
/// id; id 0 is reserved for standalone messages.
pub type CallFn = Box<dyn FnMut(Message, Arc<Dispatcher>) -> BoxFuture<'static, Result<()>> + Send>;

/// Options for the raw portion of the server.
pub struct RawServerOptions {
    /// The message exchange hook. Required.
    pub call: CallFn,
}

/// Serializes all frame writes onto the (hijacked) stdout stream.
pub struct Dispatcher {
    out: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(out: Box<dyn AsyncWrite + Send + Unpin>, cancel: CancellationToken) -> Self {
        Self {
            out: tokio::sync::Mutex::new(out),
            cancel,
        }
    }

    /// Write one frame. `size` is stamped from the body length.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.send_all(std::slice::from_ref(msg)).await
    }

    /// Write a batch of frames under a single writer acquisition.
    pub async fn send_all(&self, msgs: &[Message]) -> Result<()> {
        let mut out = self.out.lock().await;
        for msg in msgs {
            if let Err(err) = msg.write(&mut *out).await {
                // A dead writer means the client is gone; stop the loop.
                error!(%err, "frame write failed, shutting down");
                self.cancel.cancel();
                return Err(err);
            }
        }
        Ok(())
    }
}

static STARTED: AtomicBool = AtomicBool::new(false);

/// A server handling raw frames with a header and byte body.
pub struct RawServer {
    call: CallFn,
    on_dispatcher: Option<Box<dyn FnOnce(Arc<Dispatcher>) + Send>>,
}

impl RawServer {
    /// Create a new raw server from the given options.
    pub fn new(opts: RawServerOptions) -> Self {
        Self {
            call: opts.call,
            on_dispatcher: None,
        }
    }

    /// Register a hook that runs once the dispatcher exists, before the
    /// first frame is read. The typed server uses it to start the
    /// standalone-message forwarder.
    pub(crate) fn on_dispatcher(&mut self, hook: impl FnOnce(Arc<Dispatcher>) + Send + 'static) {
        self.on_dispatcher = Some(Box::new(hook));
    }

    /// Hijack stdout, announce readiness, and run the read loop until the
    /// client closes stdin (clean EOF) or a fatal error occurs.
    pub async fn start(mut self) -> Result<()> {
        if STARTED.swap(true, Ordering::SeqCst) {
            return Err(Error::Options("server already started".into()));
        }

        let (mut frames_out, guard) = stdio::hijack_stdout()?;

        // Signal to the client that the server is ready.
        frames_out.write_all(READY_SENTINEL).await?;
        frames_out.write_all(b"\n").await?;
        frames_out.flush().await?;

        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(frames_out, cancel.clone()));
        if let Some(hook) = self.on_dispatcher.take() {
            hook(Arc::clone(&dispatcher));
        }

        let result = self.read_loop(dispatcher, cancel).await;
        guard.shutdown().await;
        result
    }

    async fn read_loop(
        &mut self,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut stdin = tokio::io::stdin();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::Protocol("outbound frame write failed".into()));
                }
                msg = Message::read(&mut stdin) => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(Error::Eof) => {
                            debug!("stdin closed, stopping server");
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    };
                    (self.call)(msg, Arc::clone(&dispatcher)).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{status, Header, HEADER_SIZE};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    fn test_dispatcher(
        out: tokio::io::DuplexStream,
    ) -> (Arc<Dispatcher>, CancellationToken) {
        let cancel = CancellationToken::new();
        (
            Arc::new(Dispatcher::new(Box::new(out), cancel.clone())),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_dispatcher_stamps_size() {
        let (tx, mut rx) = tokio::io::duplex(1024);
        let (dispatcher, _cancel) = test_dispatcher(tx);

        let mut msg = Message::new(Header::new(1, 1, status::OK), Bytes::from_static(b"hello"));
        msg.header.size = 999;
        dispatcher.send(&msg).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        rx.read_exact(&mut buf).await.unwrap();
        let header = Header::decode(&buf).unwrap();
        assert_eq!(header.size, 5);
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_dispatcher_send_all_keeps_order() {
        let (tx, mut rx) = tokio::io::duplex(4096);
        let (dispatcher, _cancel) = test_dispatcher(tx);

        let msgs: Vec<Message> = (1u32..=3)
            .map(|i| {
                Message::new(
                    Header::new(i, 1, status::CONTINUE),
                    Bytes::from(format!("m{i}")),
                )
            })
            .collect();
        dispatcher.send_all(&msgs).await.unwrap();

        for i in 1u32..=3 {
            let msg = Message::read(&mut rx).await.unwrap();
            assert_eq!(msg.header.id, i);
            assert_eq!(&msg.body[..], format!("m{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_dispatcher_write_failure_cancels() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(rx);
        let (dispatcher, cancel) = test_dispatcher(tx);

        let msg = Message::new(Header::new(1, 1, status::OK), Bytes::from_static(b"x"));
        assert!(dispatcher.send(&msg).await.is_err());
        assert!(cancel.is_cancelled());
    }
}
