//! Raw echo server: replies `echo: <body>` to every request frame.

use bytes::Bytes;
use execwire::server::{RawServer, RawServerOptions};
use execwire::{status, Message};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let server = RawServer::new(RawServerOptions {
        call: Box::new(|message: Message, dispatcher| {
            Box::pin(async move {
                let mut body = b"echo: ".to_vec();
                body.extend_from_slice(&message.body);
                let mut header = message.header;
                header.status = status::OK;
                dispatcher.send(&Message::new(header, Bytes::from(body))).await
            })
        }),
    });

    if let Err(err) = server.start().await {
        eprintln!("error: raw echo server failed: {err}");
        std::process::exit(1);
    }
}
