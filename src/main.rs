//! RTMP connection engine entry point: accepts TCP connections on the RTMP
//! listener, spawns a connection task per socket, and serves an HTTP
//! introspection endpoint.

mod args;
mod auth;
mod codec;
mod config;
mod conn;
mod data;
mod error;
mod path;
mod proc;
mod ringbuf;
mod rtmp;
mod web;

use args::Args;
use clap::Parser;
use conn::{ConnRegistry, ConnSettings};
use log::{error, info};
use path::PathManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use web::metrics::EngineMetrics;
use web::shared::SharedState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = args.load_config()?;

    let log_level = if args.verbose { "debug".to_string() } else { config.logging.level.clone() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("starting rtmp connection engine, listening on {}", config.server.listen_addr);

    let rtsp_port = config
        .server
        .rtsp_port()
        .ok_or("server.rtsp_address must include a valid port")?;
    let settings = ConnSettings {
        read_timeout: config.server.read_timeout(),
        write_timeout: config.server.write_timeout(),
        read_buffer_count: config.server.read_buffer_count,
        run_on_connect: config.server.run_on_connect.clone(),
        rtsp_port,
    };

    let path_manager = Arc::new(PathManager::new(config.path_defaults()));
    let metrics = Arc::new(EngineMetrics::new().map_err(|e| format!("failed to build metrics registry: {e}"))?);
    let shared_state = Arc::new(SharedState::new(config.clone(), metrics));
    let shutdown = CancellationToken::new();

    let http_addr = config.http.listen_addr.clone();
    let http_state = shared_state.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = web::run_http_server(&http_addr, http_state).await {
            error!("http introspection server exited: {e}");
        }
    });

    let listener = TcpListener::bind(&config.server.listen_addr).await?;

    let accept_shutdown = shutdown.clone();
    let accept_result = tokio::select! {
        res = accept_loop(listener, path_manager, settings, shared_state, shutdown.clone()) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            accept_shutdown.cancel();
            Ok(())
        }
    };

    http_handle.abort();
    accept_result
}

async fn accept_loop(
    listener: TcpListener,
    path_manager: Arc<PathManager>,
    settings: ConnSettings,
    shared_state: Arc<SharedState>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry: Arc<dyn ConnRegistry> = shared_state;
    loop {
        let (socket, remote_addr) = tokio::select! {
            res = listener.accept() => res?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        if let Err(e) = socket.set_nodelay(true) {
            error!("failed to set TCP_NODELAY for {remote_addr}: {e}");
        }

        let path_manager = path_manager.clone();
        let settings = settings.clone();
        let registry = registry.clone();
        let conn_cancel = shutdown.child_token();

        tokio::spawn(async move {
            conn::run(socket, remote_addr, path_manager, settings, conn_cancel, Some(registry)).await;
        });
    }
}
