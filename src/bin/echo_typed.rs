//! Typed echo server used by the integration tests.
//!
//! Behavior is steered by the configuration the client pushes on startup
//! and by a handful of environment knobs (delayed delivery, hashing, and
//! deliberate stray prints that exercise the stdout hijack).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use execwire::identity::{Fnv1a64, Receipt};
use execwire::server::{Call, ProtocolInfo, Server};
use execwire::{Error, Header, Message};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EchoConfig {
    call_should_fail: bool,
    send_log_message: bool,
    no_close: bool,
    no_reading_receipt: bool,
    drop_messages: bool,
    num_messages: usize,
}

impl EchoConfig {
    fn normalize(&mut self) {
        if self.num_messages < 1 {
            self.num_messages = 1;
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EchoRequest {
    text: String,
    sleep_millis: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoMessage {
    hello: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EchoReceipt {
    last_modified: i64,
    e_tag: String,
    size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    text: String,
}

impl Receipt for EchoReceipt {
    const HAS_TAG: bool = true;
    const HAS_SIZE: bool = true;
    const HAS_LAST_MODIFIED: bool = true;

    fn get_tag(&self) -> &str {
        &self.e_tag
    }
    fn set_tag(&mut self, tag: String) {
        self.e_tag = tag;
    }
    fn get_size(&self) -> u32 {
        self.size
    }
    fn set_size(&mut self, size: u32) {
        self.size = size;
    }
    fn get_last_modified(&self) -> i64 {
        self.last_modified
    }
    fn set_last_modified(&mut self, secs: i64) {
        self.last_modified = secs;
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

fn log_message(body: &'static str) -> Message {
    Message::new(Header::new(0, 32, 150), Bytes::from_static(body.as_bytes()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let delay_delivery = env_flag("EXECRPC_DELAY_DELIVERY");
    let no_hasher = env_flag("EXECRPC_NO_HASHER");
    let print_outside_before = env_flag("EXECRPC_PRINT_OUTSIDE_SERVER_BEFORE");
    let print_outside_after = env_flag("EXECRPC_PRINT_OUTSIDE_SERVER_AFTER");
    let print_inside = env_flag("EXECRPC_PRINT_INSIDE_SERVER");

    if print_outside_before {
        println!("Printing outside server before");
    }

    let config = Arc::new(Mutex::new(EchoConfig::default()));
    let init_config = Arc::clone(&config);

    let mut builder = Server::<EchoConfig, EchoRequest, EchoMessage, EchoReceipt>::builder()
        .delay_delivery(delay_delivery)
        .init(move |mut cfg: EchoConfig, info: ProtocolInfo| {
            if info.version != 3 {
                return Err(Error::Options(format!(
                    "unsupported protocol version: {}",
                    info.version
                )));
            }
            cfg.normalize();
            *init_config.lock().unwrap() = cfg;
            Ok(())
        })
        .handle(move |mut call: Call<EchoRequest, EchoMessage, EchoReceipt>| {
            let config = Arc::clone(&config);
            async move {
                if print_inside {
                    println!("Printing inside server");
                }
                let cfg = config.lock().unwrap().clone();

                if cfg.call_should_fail {
                    call.close(
                        false,
                        EchoReceipt {
                            error: Some("failed to echo".to_string()),
                            ..EchoReceipt::default()
                        },
                    );
                    return;
                }

                if cfg.send_log_message {
                    let _ = call.send_raw(log_message("first log message")).await;
                    let _ = call.send_raw(log_message("second log message")).await;
                }

                let text = call.request().text.clone();
                let sleep_millis = call.request().sleep_millis;
                if sleep_millis > 0 {
                    tokio::time::sleep(Duration::from_millis(sleep_millis)).await;
                }

                for i in 0..cfg.num_messages {
                    let _ = call
                        .enqueue(EchoMessage {
                            hello: format!("{i}: Hello {text}!"),
                        })
                        .await;
                }

                if !cfg.no_close {
                    let mut receipt = EchoReceipt::default();
                    if !cfg.no_reading_receipt {
                        receipt = call.receipt().await.unwrap_or_default();
                        receipt.text = format!("echoed: {text}");
                    }
                    call.close(cfg.drop_messages, receipt);
                }
            }
        });

    if !no_hasher {
        builder = builder.hasher(|| Box::new(Fnv1a64::new()));
    }

    let server = match builder.build() {
        Ok(server) => server,
        Err(err) => {
            eprintln!("error: failed to build typed echo server: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.start().await {
        eprintln!("error: typed echo server failed: {err}");
        std::process::exit(1);
    }

    if print_outside_after {
        println!("Printing outside server after");
    }
}
