//! Client side: spawn the server, multiplex calls over its stdio.

mod raw;
mod typed;

pub use raw::{RawClient, RawClientOptions};
pub use typed::{Client, ClientBuilder, Response};
