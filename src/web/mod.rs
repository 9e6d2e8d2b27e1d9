//! HTTP introspection server: health, metrics, and connection listing.

pub mod metrics;
pub mod shared;
pub use shared::SharedState;

pub mod http_server;
pub use http_server::run_http_server;
