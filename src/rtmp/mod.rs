//! RTMP framing: handshake/session adapter and URL/path parsing.

pub mod framer;
pub mod url;
