//! Server side: raw frame loop, per-request calls, typed handlers.
//!
//! A server process is started by the client with its stdio piped; frames
//! come in on stdin and go out on the preserved stdout (the process-level
//! stdout is hijacked so stray prints land on stderr instead of corrupting
//! the stream).
//!
//! # Example
//!
//! ```ignore
//! use execwire::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> execwire::Result<()> {
//!     let server = Server::<MyConfig, MyRequest, MyMessage, MyReceipt>::builder()
//!         .init(|config, info| {
//!             // validate info.version, store config
//!             Ok(())
//!         })
//!         .handle(|mut call| async move {
//!             call.enqueue(MyMessage::from(call.request())).await.ok();
//!             let receipt = call.receipt().await.unwrap_or_default();
//!             call.close(false, receipt);
//!         })
//!         .build()?;
//!     server.start().await
//! }
//! ```

mod call;
mod raw;
mod stdio;
mod typed;

pub use call::Call;
pub use raw::{BoxFuture, CallFn, Dispatcher, RawServer, RawServerOptions};
pub use typed::{ProtocolInfo, Server, ServerBuilder};
