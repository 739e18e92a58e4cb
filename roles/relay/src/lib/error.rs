//! Relay error types.
//!
//! One enum for everything the role can fail on, with `From` conversions so
//! the subsystems can use `?` throughout. Per-conversation errors never
//! propagate past the session task; only configuration and key-store-open
//! failures reach the process exit code.

use std::fmt;

use ext_config::ConfigError;

pub type RelayResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Errors on bad CLI argument input.
    BadCliArgs,
    /// Errors on bad `config` TOML deserialize.
    BadConfigDeserialize(ConfigError),
    /// Errors on socket setup or stream I/O.
    Io(std::io::Error),
    /// Errors from the key store adapter.
    Store(keydb::Error),
    /// Errors from the MAVLink codec (unknown id on send).
    Codec(mavlink_codec::Error),
    /// Errors from the WebSocket/TLS layer.
    WebSocket(network_helpers::websocket::Error),
    /// The status channel closed under the supervisor.
    ChannelRecv(async_channel::RecvError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            BadCliArgs => write!(f, "Bad CLI arg input"),
            BadConfigDeserialize(ref e) => write!(f, "Bad `config` TOML deserialize: `{e:?}`"),
            Io(ref e) => write!(f, "I/O error: `{e:?}`"),
            Store(ref e) => write!(f, "Key store error: `{e:?}`"),
            Codec(ref e) => write!(f, "Codec error: `{e}`"),
            WebSocket(ref e) => write!(f, "WebSocket error: `{e}`"),
            ChannelRecv(ref e) => write!(f, "Channel receive error: `{e:?}`"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::BadConfigDeserialize(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<keydb::Error> for Error {
    fn from(e: keydb::Error) -> Self {
        Error::Store(e)
    }
}

impl From<mavlink_codec::Error> for Error {
    fn from(e: mavlink_codec::Error) -> Self {
        Error::Codec(e)
    }
}

impl From<network_helpers::websocket::Error> for Error {
    fn from(e: network_helpers::websocket::Error) -> Self {
        Error::WebSocket(e)
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(e: async_channel::RecvError) -> Self {
        Error::ChannelRecv(e)
    }
}
