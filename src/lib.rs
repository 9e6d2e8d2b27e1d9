//! RTMP connection engine: handshake, auth, and bidirectional media pump
//! bridging RTMP to an internal RTP-based path bus.

pub mod args;
pub mod auth;
pub mod codec;
pub mod config;
pub mod conn;
pub mod data;
pub mod error;
pub mod path;
pub mod proc;
pub mod ringbuf;
pub mod rtmp;
pub mod web;

pub use config::Config;
pub use conn::{ConnSettings, Connection};
pub use error::ConnError;
pub use path::PathManager;
