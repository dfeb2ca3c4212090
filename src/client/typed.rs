//! Typed client: codecs on top of the raw client, plus the one-time
//! configuration exchange.
//!
//! # Example
//!
//! ```ignore
//! use execwire::client::Client;
//! use execwire::codec::JsonCodec;
//!
//! let client = Client::<EchoRequest, EchoMessage, EchoReceipt, JsonCodec>::builder("my-server")
//!     .version(3)
//!     .codec(JsonCodec)
//!     .config(EchoConfig::default())
//!     .start()
//!     .await?;
//!
//! let mut response = client.execute(EchoRequest { text: "world".into() });
//! while let Some(message) = response.recv().await {
//!     println!("{message:?}");
//! }
//! let receipt = response.receipt().await;
//! ```

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::raw::{RawClient, RawClientOptions};
use crate::codec::{Codec, ENV_CLIENT_CODEC};
use crate::error::{Error, Result};
use crate::protocol::{status, Message};

/// Builder for a typed [`Client`].
///
/// The codec is required; the configuration value defaults to
/// `C::default()` when not supplied.
pub struct ClientBuilder<C, Q, M, R, D> {
    raw: RawClientOptions,
    config: Option<C>,
    codec: Option<D>,
    _marker: PhantomData<fn(Q) -> (M, R)>,
}

impl<C, Q, M, R, D> ClientBuilder<C, Q, M, R, D>
where
    C: Serialize + Default,
    Q: Serialize,
    M: DeserializeOwned + Send + 'static,
    R: DeserializeOwned + Send + 'static,
    D: Codec,
{
    /// Create a builder for the given server executable.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            raw: RawClientOptions {
                cmd: cmd.into(),
                version: 1,
                ..RawClientOptions::default()
            },
            config: None,
            codec: None,
            _marker: PhantomData,
        }
    }

    /// Declare the major protocol version sent with every request.
    pub fn version(mut self, version: u16) -> Self {
        self.raw.version = version;
        self
    }

    /// Append an argument for the server command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.raw.args.push(arg.into());
        self
    }

    /// Append several arguments for the server command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the server process. Entries here
    /// win over the parent environment.
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.raw.env.push((key.into(), val.into()));
        self
    }

    /// Set the server's working directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw.dir = Some(dir.into());
        self
    }

    /// Set the startup and per-call timeout (default 30 s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.raw.timeout = Some(timeout);
        self
    }

    /// Set the configuration pushed to the server on startup.
    pub fn config(mut self, config: C) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the payload codec. Required.
    pub fn codec(mut self, codec: D) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Start the server process and perform the configuration exchange.
    pub async fn start(mut self) -> Result<Client<Q, M, R, D>> {
        let codec = self
            .codec
            .take()
            .ok_or_else(|| Error::Options("codec is required".into()))?;

        // Tell the server what codec is in use, in case it has none
        // configured statically.
        self.raw
            .env
            .push((ENV_CLIENT_CODEC.to_string(), codec.name().to_string()));

        let raw = Arc::new(RawClient::start(self.raw).await?);
        let client = Client {
            raw,
            codec: Arc::new(codec),
            _marker: PhantomData,
        };
        client.init(self.config.unwrap_or_default()).await?;
        Ok(client)
    }
}

/// A typed RPC client issuing requests of type `Q` and receiving streamed
/// messages of type `M` followed by a receipt of type `R`.
pub struct Client<Q, M, R, D> {
    raw: Arc<RawClient>,
    codec: Arc<D>,
    _marker: PhantomData<fn(Q) -> (M, R)>,
}

impl<Q, M, R, D> Client<Q, M, R, D>
where
    Q: Serialize,
    M: DeserializeOwned + Send + 'static,
    R: DeserializeOwned + Send + 'static,
    D: Codec,
{
    /// Create a builder for the given server executable.
    pub fn builder<C>(cmd: impl Into<String>) -> ClientBuilder<C, Q, M, R, D>
    where
        C: Serialize + Default,
    {
        ClientBuilder::new(cmd)
    }

    /// Push the configuration to the server, exactly once.
    async fn init<C: Serialize>(&self, config: C) -> Result<()> {
        let body = self.codec.encode(&config)?;
        let (tx, mut rx) = mpsc::channel(10);

        self.raw
            .execute_with_status(status::INIT_SERVER, Bytes::from(body), tx)
            .await?;

        let reply = rx
            .recv()
            .await
            .ok_or_else(|| Error::Protocol("no response to init".into()))?;
        if reply.header.status != status::OK {
            return Err(Error::ServerStatus {
                code: reply.header.status,
                body: String::from_utf8_lossy(&reply.body).into_owned(),
            });
        }
        debug!("server initialized");
        Ok(())
    }

    /// Send a request and return its response streams.
    ///
    /// Check [`Response::err`] both before and after draining the message
    /// and receipt channels.
    pub fn execute(&self, request: Q) -> Response<M, R> {
        let (msg_tx, msg_rx) = mpsc::channel(10);
        let (receipt_tx, receipt_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let response = Response {
            messages: msg_rx,
            receipt: receipt_rx,
            errors: err_rx,
        };

        let body = match self.codec.encode(&request) {
            Ok(body) => body,
            Err(err) => {
                let _ = err_tx.try_send(err);
                return response;
            }
        };

        let raw = Arc::clone(&self.raw);
        let codec = Arc::clone(&self.codec);
        tokio::spawn(async move {
            let (raw_tx, raw_rx) = mpsc::channel(10);
            // Report call failures (timeout, shutdown) as soon as they
            // happen; the pump may keep waiting on an orphaned stream.
            let exec = {
                let raw = Arc::clone(&raw);
                let err_tx = err_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = raw.execute(Bytes::from(body), raw_tx).await {
                        let _ = err_tx.try_send(err);
                    }
                })
            };

            pump_response(codec, raw_rx, msg_tx, receipt_tx, &err_tx).await;
            let _ = exec.await;
        });

        response
    }

    /// Take the receiver for standalone (id 0) messages from the server,
    /// typically log lines. Yields `None` after the first call.
    pub fn take_raw_messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.raw.take_raw_messages()
    }

    /// Close the client and wait for the server process to quit.
    pub async fn close(&self) -> Result<()> {
        self.raw.close().await
    }
}

/// Decode raw frames into the typed channels until the terminal frame, a
/// system error status, or the end of the raw stream.
async fn pump_response<M, R, D>(
    codec: Arc<D>,
    mut raw_rx: mpsc::Receiver<Message>,
    msg_tx: mpsc::Sender<M>,
    receipt_tx: mpsc::Sender<R>,
    err_tx: &mpsc::Sender<Error>,
) where
    M: DeserializeOwned + Send + 'static,
    R: DeserializeOwned + Send + 'static,
    D: Codec,
{
    while let Some(frame) = raw_rx.recv().await {
        if status::is_system_error(frame.header.status) {
            let _ = err_tx.try_send(Error::ServerStatus {
                code: frame.header.status,
                body: String::from_utf8_lossy(&frame.body).into_owned(),
            });
            return;
        }
        match frame.header.status {
            status::CONTINUE => match codec.decode::<M>(&frame.body) {
                Ok(message) => {
                    if msg_tx.send(message).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = err_tx.try_send(err);
                    return;
                }
            },
            status::INIT_SERVER => {
                let _ = err_tx.try_send(Error::Protocol(
                    "unexpected init status on response frame".into(),
                ));
                return;
            }
            // Anything else is the terminal receipt.
            _ => {
                match codec.decode::<R>(&frame.body) {
                    Ok(receipt) => {
                        let _ = receipt_tx.try_send(receipt);
                    }
                    Err(err) => {
                        let _ = err_tx.try_send(err);
                    }
                }
                return;
            }
        }
    }
}

/// The result of one request: zero or more messages, then one receipt.
///
/// The message channel is bounded; a consumer that stops reading applies
/// backpressure all the way to the shared connection reader, stalling
/// other calls too.
pub struct Response<M, R> {
    messages: mpsc::Receiver<M>,
    receipt: mpsc::Receiver<R>,
    errors: mpsc::Receiver<Error>,
}

impl<M, R> Response<M, R> {
    /// Next streamed message, or `None` once the stream is finished.
    pub async fn recv(&mut self) -> Option<M> {
        self.messages.recv().await
    }

    /// The terminal receipt. `None` when the call failed; see
    /// [`Response::err`].
    pub async fn receipt(&mut self) -> Option<R> {
        self.receipt.recv().await
    }

    /// Non-blocking check for an error on this call. A non-`None` result
    /// after the stream drained means the call aborted mid-stream.
    pub fn err(&mut self) -> Option<Error> {
        self.errors.try_recv().ok()
    }
}
