//! # execwire
//!
//! Bidirectional, multiplexed, framed RPC over a child process's standard
//! input and output.
//!
//! A client starts the server as a child process and keeps a long-lived
//! connection over its stdio pipes. Many concurrent requests share the one
//! connection; each produces zero or more streamed messages followed by a
//! terminal receipt. Standalone server-to-client messages (e.g. log lines)
//! travel on the same pipes under the reserved id 0.
//!
//! ## Wire format
//!
//! Every frame is a fixed 12-byte big-endian header (`id: u32`,
//! `version: u16`, `status: u16`, `size: u32`) followed by `size` opaque
//! body bytes. Payload bodies are produced by a pluggable [`codec::Codec`]
//! (JSON, TOML or MessagePack); the client announces its choice to the
//! server through the `EXECRPC_CLIENT_CODEC` environment variable.
//!
//! ## Sides
//!
//! - [`client::Client`] / [`client::RawClient`] — parent side: spawns the
//!   server, waits for its ready sentinel, demultiplexes response frames.
//! - [`server::Server`] / [`server::RawServer`] — child side: hijacks
//!   process stdout so stray prints cannot corrupt the frame stream, runs
//!   one task per in-flight request, decorates receipts with size, content
//!   tag and last-modified time.
//!
//! ## Example
//!
//! ```ignore
//! use execwire::client::Client;
//! use execwire::codec::JsonCodec;
//!
//! let client = Client::<Req, Msg, Receipt, JsonCodec>::builder("echo-server")
//!     .version(3)
//!     .codec(JsonCodec)
//!     .config(Config::default())
//!     .start()
//!     .await?;
//!
//! let mut response = client.execute(Req { text: "world".into() });
//! while let Some(message) = response.recv().await {
//!     println!("message: {message:?}");
//! }
//! if let Some(receipt) = response.receipt().await {
//!     println!("receipt: {receipt:?}");
//! }
//! client.close().await?;
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod server;

mod transport;

pub use client::{Client, RawClient};
pub use codec::{AnyCodec, Codec, JsonCodec, MsgPackCodec, TomlCodec};
pub use error::{Error, Result};
pub use identity::{Fnv1a64, Identity, MessageHasher, Receipt};
pub use protocol::{status, Header, Message};
pub use server::{Call, ProtocolInfo, RawServer, Server};
