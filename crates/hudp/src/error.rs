use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Errors surfaced across the public API.
///
/// `MalformedDatagram` and callback failures never reach this type: both are
/// caught and logged at the point they occur, per the core's error handling
/// policy (a hostile or malformed datagram must never crash the endpoint).
/// A permanently dropped sequence likewise never surfaces here — it is
/// reported exclusively through the sender's drop callback, since the
/// dropping happens on a background worker with no caller to return to.
#[derive(Error, Debug)]
pub enum HudpError {
    /// `send` was called before a peer address was set.
    #[error("no peer address set")]
    NoPeer,

    /// The effective window stayed exhausted for `send_block_timeout_ms`.
    #[error("send window full, timed out waiting for space")]
    WouldBlock,

    /// An OS-level error on the socket; the receive loop stops after this.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, HudpError>;
