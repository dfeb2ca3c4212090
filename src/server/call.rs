//! Per-request handler state.
//!
//! A [`Call`] is handed to the user's handler for every request frame. The
//! handler streams messages with [`Call::enqueue`], may emit standalone
//! id-0 frames with [`Call::send_raw`], and finishes with [`Call::close`].
//! Fetching [`Call::receipt`] first yields the framework-prepared receipt
//! (size, content tag and last-modified already filled in) so the handler
//! can adjust it before closing.
//!
//! Dropping the call without closing makes the framework send an empty,
//! decorator-defaulted receipt on the handler's behalf.

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Capacity of the per-request message queue.
pub(crate) const MESSAGE_QUEUE_CAPACITY: usize = 10;

/// State for one in-flight request on the server.
pub struct Call<Q, M, R> {
    request: Q,
    messages: Option<mpsc::Sender<M>>,
    raw_messages: mpsc::Sender<Message>,
    receipt: Option<oneshot::Receiver<R>>,
    close: Option<oneshot::Sender<(bool, R)>>,
}

impl<Q, M, R> Call<Q, M, R> {
    pub(crate) fn new(
        request: Q,
        messages: mpsc::Sender<M>,
        raw_messages: mpsc::Sender<Message>,
        receipt: oneshot::Receiver<R>,
        close: oneshot::Sender<(bool, R)>,
    ) -> Self {
        Self {
            request,
            messages: Some(messages),
            raw_messages,
            receipt: Some(receipt),
            close: Some(close),
        }
    }

    /// The decoded request.
    pub fn request(&self) -> &Q {
        &self.request
    }

    /// Queue one message for delivery to the client.
    ///
    /// Applies backpressure once the queue is full. Fails after the
    /// messages queue has been closed by [`Call::receipt`], or when the
    /// connection is going down.
    pub async fn enqueue(&self, message: M) -> Result<()> {
        let messages = self
            .messages
            .as_ref()
            .ok_or_else(|| Error::Options("messages queue is closed".into()))?;
        messages
            .send(message)
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Queue several messages in order.
    pub async fn enqueue_all(&self, messages: impl IntoIterator<Item = M>) -> Result<()> {
        for message in messages {
            self.enqueue(message).await?;
        }
        Ok(())
    }

    /// Send a standalone message to the client, outside the
    /// request/response exchange (typically a log line).
    ///
    /// # Panics
    ///
    /// Panics if the message id is not 0; standalone messages must never
    /// carry a request id.
    pub async fn send_raw(&self, message: Message) -> Result<()> {
        assert_eq!(
            message.header.id, 0,
            "message id must be 0 for standalone messages"
        );
        self.raw_messages
            .send(message)
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Close the messages queue and wait for the framework-prepared
    /// receipt, decorated with the accumulated size, content tag and
    /// last-modified time.
    ///
    /// Can only be called once.
    pub async fn receipt(&mut self) -> Result<R> {
        // No more messages once the receipt is requested.
        self.messages.take();
        let receipt = self
            .receipt
            .take()
            .ok_or_else(|| Error::Options("receipt already fetched".into()))?;
        receipt.await.map_err(|_| Error::Shutdown)
    }

    /// Finalize the call: send any buffered messages (unless
    /// `drop_buffered` is set and the server runs with delayed delivery)
    /// followed by the terminal receipt frame.
    pub fn close(mut self, drop_buffered: bool, receipt: R) {
        if let Some(close) = self.close.take() {
            let _ = close.send((drop_buffered, receipt));
        }
    }
}
