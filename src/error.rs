//! Error types for execwire.

use thiserror::Error;

/// Main error type for all client and server operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the child's stdio pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML serialization error.
    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    /// TOML deserialization error.
    #[error("TOML decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// No codec registered under the given name.
    #[error("unknown codec {0:?}")]
    UnknownCodec(String),

    /// Invalid client or server options.
    #[error("invalid options: {0}")]
    Options(String),

    /// Protocol error (unknown id from the peer, corrupt frame, etc.).
    /// Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server replied with a system-reserved error status.
    /// The body of the frame is a human-readable diagnostic.
    #[error("{body} (error code {code})")]
    ServerStatus {
        /// The status code carried in the frame header.
        code: u16,
        /// The diagnostic string carried in the frame body.
        body: String,
    },

    /// Failed to launch the server process or to complete the startup
    /// handshake. Includes the captured tail of the child's stderr.
    #[error("failed to start server: {reason}: {stderr}")]
    StartFailed {
        /// What went wrong.
        reason: String,
        /// Tail of the child's stderr at the time of the failure.
        stderr: String,
    },

    /// The connection is or is about to be shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// The peer went away mid-conversation.
    #[error("unexpected EOF")]
    UnexpectedEof,

    /// Clean EOF at a frame boundary. Translated into [`Error::Shutdown`]
    /// or [`Error::UnexpectedEof`] by the client reader; a normal stop
    /// signal for the server loop.
    #[error("EOF")]
    Eof,

    /// The ready sentinel did not appear within the startup timeout.
    #[error("timed out waiting for server to start")]
    TimedOutWaitingForServer,

    /// A call did not complete within the configured timeout.
    #[error("timed out waiting for call to complete")]
    TimedOutWaitingForCall,

    /// The server process did not exit within the shutdown grace period.
    #[error("timed out waiting for server to finish")]
    TimedOutWaitingForExit,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
