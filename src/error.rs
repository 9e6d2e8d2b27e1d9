//! Error kinds produced while driving a single RTMP connection.

use thiserror::Error;

/// Errors that can terminate a connection's inner task.
///
/// `AuthCritical` is distinguished from the other variants because the
/// caller must impose the anti-brute-force delay before closing the socket;
/// every other variant closes immediately.
#[derive(Debug, Error)]
pub enum ConnError {
    /// An authentication check failed. The caller sleeps 2s before closing.
    #[error("auth critical: {0}")]
    AuthCritical(String),

    /// Handshake, track negotiation, or path-manager setup failed.
    #[error("setup error: {0}")]
    Setup(String),

    /// Socket or handshake I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Codec encode/decode failure during the publish pump.
    #[error("codec error: {0}")]
    Codec(String),

    /// Synthetic error produced when the parent cancels the connection.
    #[error("terminated")]
    Terminated,
}
