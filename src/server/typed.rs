//! Typed server: decode requests, run handlers, decorate receipts.
//!
//! [`Server`] layers typed request handling on top of [`RawServer`]. Each
//! request frame gets its own task running the user handler next to a
//! framework pump that encodes queued messages, tracks the running body
//! size and content hash, and emits the single terminal receipt frame.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::call::{Call, MESSAGE_QUEUE_CAPACITY};
use super::raw::{BoxFuture, Dispatcher, RawServer, RawServerOptions};
use crate::codec::{AnyCodec, Codec};
use crate::error::{Error, Result};
use crate::identity::{decorate, HasherFactory, MessageHasher, Receipt};
use crate::protocol::{status, Header, Message};

/// Protocol information passed to the server's init hook.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolInfo {
    /// The major protocol version declared by the client. Any increment
    /// should be considered a breaking change.
    pub version: u16,
}

type InitFn<C> = Box<dyn FnMut(C, ProtocolInfo) -> Result<()> + Send>;
type HandleFn<Q, M, R> = Arc<dyn Fn(Call<Q, M, R>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builder for a typed [`Server`].
///
/// `handle` is required; `init` is required in practice (the client's
/// configuration exchange is answered with an error frame when it is
/// missing). The codec defaults to whatever the client announced through
/// the environment.
pub struct ServerBuilder<C, Q, M, R> {
    init: Option<InitFn<C>>,
    handle: Option<HandleFn<Q, M, R>>,
    codec: Option<AnyCodec>,
    hasher: Option<HasherFactory>,
    delay_delivery: bool,
}

impl<C, Q, M, R> ServerBuilder<C, Q, M, R>
where
    C: DeserializeOwned + Send + 'static,
    Q: DeserializeOwned + Send + 'static,
    M: Serialize + Send + 'static,
    R: Receipt + Serialize,
{
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            init: None,
            handle: None,
            codec: None,
            hasher: None,
            delay_delivery: false,
        }
    }

    /// Set the hook run on the one-time configuration exchange. Returning
    /// an error rejects the client with `ErrInitServerFailed`.
    pub fn init<F>(mut self, f: F) -> Self
    where
        F: FnMut(C, ProtocolInfo) -> Result<()> + Send + 'static,
    {
        self.init = Some(Box::new(f));
        self
    }

    /// Set the per-request handler.
    pub fn handle<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Call<Q, M, R>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle = Some(Arc::new(move |call| Box::pin(f(call))));
        self
    }

    /// Pin the payload codec instead of resolving it from the environment.
    pub fn codec(mut self, codec: AnyCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Install a hasher factory for receipt content tags. One hasher is
    /// created per request; without a factory no tag is computed.
    pub fn hasher<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Box<dyn MessageHasher> + Send + Sync + 'static,
    {
        self.hasher = Some(Arc::new(f));
        self
    }

    /// Buffer messages in memory until the call closes. `close` may then
    /// flush or drop them; useful when the client wants to compare the
    /// receipt's content tag before committing to the stream.
    pub fn delay_delivery(mut self, delay: bool) -> Self {
        self.delay_delivery = delay;
        self
    }

    /// Build the server.
    pub fn build(self) -> Result<Server<C, Q, M, R>> {
        let handle = self
            .handle
            .ok_or_else(|| Error::Options("handle function is required".into()))?;
        let codec = match self.codec {
            Some(codec) => codec,
            None => AnyCodec::from_env()?,
        };

        let (raw_tx, raw_rx) = mpsc::channel::<Message>(MESSAGE_QUEUE_CAPACITY);

        let mut init = self.init;
        let hasher = self.hasher;
        let delay_delivery = self.delay_delivery;

        let call: super::raw::CallFn = Box::new(move |message: Message, dispatcher| {
            if message.header.status == status::INIT_SERVER {
                let reply = handle_init(&mut init, &codec, &message);
                return Box::pin(async move { dispatcher.send(&reply).await });
            }

            let handle = Arc::clone(&handle);
            let hasher = hasher.clone();
            let raw_tx = raw_tx.clone();
            tokio::spawn(run_request(
                message,
                codec,
                handle,
                hasher,
                delay_delivery,
                raw_tx,
                dispatcher,
            ));
            Box::pin(async { Ok(()) })
        });

        let mut raw = RawServer::new(RawServerOptions { call });

        // Forward standalone messages to the writer in their own task.
        raw.on_dispatcher(move |dispatcher| {
            let mut raw_rx = raw_rx;
            tokio::spawn(async move {
                while let Some(msg) = raw_rx.recv().await {
                    if dispatcher.send(&msg).await.is_err() {
                        break;
                    }
                }
            });
        });

        Ok(Server {
            raw,
            _marker: PhantomData,
        })
    }
}

impl<C, Q, M, R> Default for ServerBuilder<C, Q, M, R>
where
    C: DeserializeOwned + Send + 'static,
    Q: DeserializeOwned + Send + 'static,
    M: Serialize + Send + 'static,
    R: Receipt + Serialize,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A typed server for requests of type `Q`, streamed messages of type `M`
/// and receipts of type `R`, configured once with a value of type `C`.
pub struct Server<C, Q, M, R> {
    raw: RawServer,
    _marker: PhantomData<fn(C, Q) -> (M, R)>,
}

impl<C, Q, M, R> Server<C, Q, M, R>
where
    C: DeserializeOwned + Send + 'static,
    Q: DeserializeOwned + Send + 'static,
    M: Serialize + Send + 'static,
    R: Receipt + Serialize,
{
    /// Create a builder.
    pub fn builder() -> ServerBuilder<C, Q, M, R> {
        ServerBuilder::new()
    }

    /// Run the server until the client closes stdin.
    pub async fn start(self) -> Result<()> {
        self.raw.start().await
    }
}

/// Answer the one-time configuration exchange.
fn handle_init<C>(init: &mut Option<InitFn<C>>, codec: &AnyCodec, message: &Message) -> Message
where
    C: DeserializeOwned,
{
    let Some(init) = init.as_mut() else {
        return error_message(
            Error::Options("init function is required".into()),
            message.header,
            status::ERR_INIT_SERVER_FAILED,
        );
    };

    let config: C = match codec.decode(&message.body) {
        Ok(config) => config,
        Err(err) => return error_message(err, message.header, status::ERR_DECODE_FAILED),
    };

    let info = ProtocolInfo {
        version: message.header.version,
    };
    match init(config, info) {
        Ok(()) => {
            let mut header = message.header;
            header.status = status::OK;
            Message::new(header, Bytes::new())
        }
        Err(err) => error_message(err, message.header, status::ERR_INIT_SERVER_FAILED),
    }
}

/// Drive one request: run the handler, pump its queue, send the receipt.
async fn run_request<Q, M, R>(
    message: Message,
    codec: AnyCodec,
    handle: HandleFn<Q, M, R>,
    hasher: Option<HasherFactory>,
    delay_delivery: bool,
    raw_tx: mpsc::Sender<Message>,
    dispatcher: Arc<Dispatcher>,
) where
    Q: DeserializeOwned + Send + 'static,
    M: Serialize + Send + 'static,
    R: Receipt + Serialize,
{
    debug_assert_ne!(message.header.id, 0, "request id 0 is reserved");

    let request: Q = match codec.decode(&message.body) {
        Ok(request) => request,
        Err(err) => {
            let reply = error_message(err, message.header, status::ERR_DECODE_FAILED);
            let _ = dispatcher.send(&reply).await;
            return;
        }
    };

    let (messages_tx, mut messages_rx) = mpsc::channel::<M>(MESSAGE_QUEUE_CAPACITY);
    let (receipt_tx, receipt_rx) = oneshot::channel::<R>();
    let (close_tx, close_rx) = oneshot::channel::<(bool, R)>();
    let call = Call::new(request, messages_tx, raw_tx, receipt_rx, close_tx);
    tokio::spawn(handle(call));

    // Hashing only happens for tag-capable receipt types.
    let mut hasher = if R::HAS_TAG {
        hasher.map(|factory| factory())
    } else {
        None
    };
    let mut size: u32 = 0;
    let mut buffered: Vec<Message> = Vec::new();

    while let Some(queued) = messages_rx.recv().await {
        let mut header = message.header;
        header.status = status::CONTINUE;
        let out = match codec.encode(&queued) {
            Ok(body) => Message::new(header, Bytes::from(body)),
            Err(err) => error_message(err, message.header, status::ERR_ENCODE_FAILED),
        };
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&out.body);
        }
        size = size.wrapping_add(out.body.len() as u32);
        if delay_delivery {
            buffered.push(out);
        } else if dispatcher.send(&out).await.is_err() {
            return;
        }
    }
    let checksum = hasher.map(|hasher| hex::encode(hasher.digest()));

    // The messages queue is closed; offer the prepared receipt to the
    // handler. Nobody may be listening, which is fine.
    let mut prepared = R::default();
    decorate(&mut prepared, size, checksum.as_deref());
    let _ = receipt_tx.send(prepared);

    let (drop_buffered, mut receipt) = match close_rx.await {
        Ok(finalized) => finalized,
        // Handler returned without closing; send an empty receipt.
        Err(_) => (false, R::default()),
    };

    if delay_delivery {
        if drop_buffered {
            debug!(
                id = message.header.id,
                dropped = buffered.len(),
                "dropping buffered messages"
            );
        } else if dispatcher.send_all(&buffered).await.is_err() {
            return;
        }
    }

    decorate(&mut receipt, size, checksum.as_deref());
    let mut header = message.header;
    header.status = status::OK;
    let reply = match codec.encode(&receipt) {
        Ok(body) => Message::new(header, Bytes::from(body)),
        Err(err) => error_message(err, message.header, status::ERR_ENCODE_FAILED),
    };
    let _ = dispatcher.send(&reply).await;
}

/// Build an error-status frame whose body is a human-readable diagnostic.
fn error_message(err: Error, mut header: Header, failure_status: u16) -> Message {
    let additional = if failure_status == status::ERR_DECODE_FAILED
        || failure_status == status::ERR_ENCODE_FAILED
    {
        " Check that client and server use the same codec."
    } else {
        ""
    };
    header.status = failure_status;
    Message::new(
        header,
        Bytes::from(format!(
            "failed to create message (error code {failure_status}): {err}.{additional}"
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::identity::{Fnv1a64, Identity};
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    #[derive(Serialize, Deserialize)]
    struct Req {
        text: String,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Msg {
        hello: String,
    }

    fn dispatcher_pair(cap: usize) -> (Arc<Dispatcher>, tokio::io::DuplexStream) {
        let (tx, rx) = tokio::io::duplex(cap);
        (
            Arc::new(Dispatcher::new(Box::new(tx), CancellationToken::new())),
            rx,
        )
    }

    fn request_frame(id: u32, text: &str) -> Message {
        Message::new(
            Header::new(id, 3, 0),
            Bytes::from(serde_json::to_vec(&Req { text: text.into() }).unwrap()),
        )
    }

    fn handler<F, Fut>(f: F) -> HandleFn<Req, Msg, Identity>
    where
        F: Fn(Call<Req, Msg, Identity>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Arc::new(move |call| Box::pin(f(call)))
    }

    fn fnv_factory() -> Option<HasherFactory> {
        Some(Arc::new(|| Box::new(Fnv1a64::new()) as Box<dyn MessageHasher>))
    }

    async fn run(
        message: Message,
        handle: HandleFn<Req, Msg, Identity>,
        hasher: Option<HasherFactory>,
        delay_delivery: bool,
    ) -> Vec<Message> {
        let (dispatcher, mut rx) = dispatcher_pair(64 * 1024);
        let (raw_tx, _raw_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        run_request(
            message,
            AnyCodec::Json(JsonCodec),
            handle,
            hasher,
            delay_delivery,
            raw_tx,
            dispatcher,
        )
        .await;

        // All frames are flushed; drain until the terminal one.
        let mut frames = Vec::new();
        loop {
            let frame = Message::read(&mut rx).await.unwrap();
            let done = frame.header.status != status::CONTINUE;
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_stream_then_decorated_receipt() {
        let handle = handler(|mut call: Call<Req, Msg, Identity>| async move {
            for i in 0..3 {
                call.enqueue(Msg {
                    hello: format!("Hello {}!", i + 1),
                })
                .await
                .unwrap();
            }
            let receipt = call.receipt().await.unwrap();
            call.close(false, receipt);
        });

        let frames = run(request_frame(1, "world"), handle, fnv_factory(), false).await;
        assert_eq!(frames.len(), 4);

        let mut expected_size = 0u32;
        let mut expected_hasher = Fnv1a64::new();
        for (i, frame) in frames[..3].iter().enumerate() {
            assert_eq!(frame.header.status, status::CONTINUE);
            assert_eq!(frame.header.id, 1);
            let msg: Msg = serde_json::from_slice(&frame.body).unwrap();
            assert_eq!(msg.hello, format!("Hello {}!", i + 1));
            expected_size += frame.body.len() as u32;
            expected_hasher.update(&frame.body);
        }

        let terminal = &frames[3];
        assert_eq!(terminal.header.status, status::OK);
        let receipt: Identity = serde_json::from_slice(&terminal.body).unwrap();
        assert_eq!(receipt.size, expected_size);
        assert_eq!(receipt.e_tag, hex::encode(expected_hasher.digest()));
        assert_ne!(receipt.last_modified, 0);
    }

    #[tokio::test]
    async fn test_handler_returning_without_close_sends_receipt() {
        let handle = handler(|call: Call<Req, Msg, Identity>| async move {
            call.enqueue(Msg {
                hello: "only".to_string(),
            })
            .await
            .unwrap();
        });

        let frames = run(request_frame(2, "x"), handle, fnv_factory(), false).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].header.status, status::OK);
        let receipt: Identity = serde_json::from_slice(&frames[1].body).unwrap();
        // Synthesized receipt is still decorated.
        assert_ne!(receipt.last_modified, 0);
        assert_eq!(receipt.size, frames[0].body.len() as u32);
    }

    #[tokio::test]
    async fn test_zero_messages_explicit_close() {
        let handle = handler(|call: Call<Req, Msg, Identity>| async move {
            call.close(false, Identity::default());
        });

        let frames = run(request_frame(3, "x"), handle, fnv_factory(), false).await;
        assert_eq!(frames.len(), 1);
        let receipt: Identity = serde_json::from_slice(&frames[0].body).unwrap();
        assert_eq!(receipt.size, 0);
        // Tag of the hasher's initial digest.
        assert_eq!(receipt.e_tag, "cbf29ce484222325");
        assert_ne!(receipt.last_modified, 0);
    }

    #[tokio::test]
    async fn test_delay_delivery_drop_credits_enqueued_size() {
        let handle = handler(|mut call: Call<Req, Msg, Identity>| async move {
            call.enqueue(Msg {
                hello: "buffered".to_string(),
            })
            .await
            .unwrap();
            let receipt = call.receipt().await.unwrap();
            call.close(true, receipt);
        });

        let frames = run(request_frame(4, "x"), handle, fnv_factory(), true).await;
        // The buffered message is dropped; only the receipt goes out.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.status, status::OK);
        let receipt: Identity = serde_json::from_slice(&frames[0].body).unwrap();
        let body_len = serde_json::to_vec(&Msg {
            hello: "buffered".to_string(),
        })
        .unwrap()
        .len() as u32;
        assert_eq!(receipt.size, body_len);
        assert_ne!(receipt.e_tag, "");
    }

    #[tokio::test]
    async fn test_delay_delivery_flushes_before_receipt() {
        let handle = handler(|call: Call<Req, Msg, Identity>| async move {
            for i in 0..2 {
                call.enqueue(Msg {
                    hello: format!("m{i}"),
                })
                .await
                .unwrap();
            }
            call.close(false, Identity::default());
        });

        let frames = run(request_frame(5, "x"), handle, fnv_factory(), true).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].header.status, status::CONTINUE);
        assert_eq!(frames[1].header.status, status::CONTINUE);
        assert_eq!(frames[2].header.status, status::OK);
    }

    #[tokio::test]
    async fn test_user_receipt_values_win() {
        let handle = handler(|call: Call<Req, Msg, Identity>| async move {
            call.enqueue(Msg {
                hello: "x".to_string(),
            })
            .await
            .unwrap();
            call.close(
                false,
                Identity {
                    size: 999,
                    e_tag: "user".to_string(),
                    last_modified: 7,
                },
            );
        });

        let frames = run(request_frame(6, "x"), handle, fnv_factory(), false).await;
        let receipt: Identity = serde_json::from_slice(&frames[1].body).unwrap();
        assert_eq!(receipt.size, 999);
        assert_eq!(receipt.e_tag, "user");
        assert_eq!(receipt.last_modified, 7);
    }

    #[tokio::test]
    async fn test_no_hasher_leaves_tag_empty() {
        let handle = handler(|call: Call<Req, Msg, Identity>| async move {
            call.enqueue(Msg {
                hello: "x".to_string(),
            })
            .await
            .unwrap();
            call.close(false, Identity::default());
        });

        let frames = run(request_frame(7, "x"), handle, None, false).await;
        let receipt: Identity = serde_json::from_slice(&frames[1].body).unwrap();
        assert_eq!(receipt.e_tag, "");
        assert_ne!(receipt.size, 0);
    }

    #[tokio::test]
    async fn test_decode_failure_sends_terminal_error_frame() {
        let handle = handler(|_call: Call<Req, Msg, Identity>| async move {
            panic!("handler must not run for undecodable requests");
        });

        let (dispatcher, mut rx) = dispatcher_pair(4096);
        let (raw_tx, _raw_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let message = Message::new(Header::new(8, 3, 0), Bytes::from_static(b"not json"));
        run_request(
            message,
            AnyCodec::Json(JsonCodec),
            handle,
            fnv_factory(),
            false,
            raw_tx,
            dispatcher,
        )
        .await;

        let frame = Message::read(&mut rx).await.unwrap();
        assert_eq!(frame.header.status, status::ERR_DECODE_FAILED);
        assert_eq!(frame.header.id, 8);
        let body = String::from_utf8_lossy(&frame.body);
        assert!(body.contains("same codec"));
    }

    #[tokio::test]
    async fn test_handle_init_ok_and_rejection() {
        let mut init: Option<InitFn<Req>> = Some(Box::new(|config, info| {
            if info.version != 3 {
                return Err(Error::Options(format!(
                    "unsupported protocol version: {}",
                    info.version
                )));
            }
            assert_eq!(config.text, "cfg");
            Ok(())
        }));
        let codec = AnyCodec::Json(JsonCodec);

        let ok = handle_init(&mut init, &codec, &request_frame(1, "cfg"));
        assert_eq!(ok.header.status, status::OK);
        assert!(ok.body.is_empty());

        let mut bad = request_frame(1, "cfg");
        bad.header.version = 2;
        let rejected = handle_init(&mut init, &codec, &bad);
        assert_eq!(rejected.header.status, status::ERR_INIT_SERVER_FAILED);
        assert!(String::from_utf8_lossy(&rejected.body).contains("unsupported protocol version"));

        let mut missing: Option<InitFn<Req>> = None;
        let no_init = handle_init(&mut missing, &codec, &request_frame(1, "cfg"));
        assert_eq!(no_init.header.status, status::ERR_INIT_SERVER_FAILED);
    }
}
