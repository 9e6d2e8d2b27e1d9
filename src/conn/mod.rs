//! Per-connection state, lifecycle, and RAII cleanup.

pub mod publisher;
pub mod reader;

use crate::path::{Path, PathManager};
use arc_swap::ArcSwap;
use log::{info, warn};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Read,
    Publish,
}

impl ConnState {
    fn as_str(self) -> &'static str {
        match self {
            ConnState::Idle => "idle",
            ConnState::Read => "read",
            ConnState::Publish => "publish",
        }
    }
}

/// Static, process-lifetime configuration a connection needs without
/// reaching back into the global `Config`.
#[derive(Debug, Clone)]
pub struct ConnSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buffer_count: usize,
    pub run_on_connect: Option<String>,
    pub rtsp_port: u16,
}

pub struct Connection {
    id: String,
    remote_addr: SocketAddr,
    created_at: Instant,
    state: ArcSwap<ConnState>,
    path: OnceLock<Arc<Path>>,
    ring: OnceLock<Arc<crate::ringbuf::RingBuffer<crate::data::Data>>>,
    pub settings: ConnSettings,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr, settings: ConnSettings) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            created_at: Instant::now(),
            state: ArcSwap::from_pointee(ConnState::Idle),
            path: OnceLock::new(),
            ring: OnceLock::new(),
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Callable from any task at any time without blocking.
    pub fn safe_state(&self) -> ConnState {
        **self.state.load()
    }

    /// Monotonic: Idle -> Read|Publish only. Assigning `path` before the
    /// state change (the caller does this) is the release barrier other
    /// tasks rely on when they observe a non-idle state.
    fn transition(&self, new: ConnState) {
        debug_assert_ne!(self.safe_state(), new);
        debug_assert_eq!(self.safe_state(), ConnState::Idle, "state must only transition once, from Idle");
        self.state.store(Arc::new(new));
    }

    fn set_path(&self, path: Arc<Path>) {
        let _ = self.path.set(path);
    }

    pub fn path(&self) -> Option<&Arc<Path>> {
        self.path.get()
    }

    fn set_ring(&self, ring: Arc<crate::ringbuf::RingBuffer<crate::data::Data>>) {
        let _ = self.ring.set(ring);
    }

    pub fn ring(&self) -> Option<&Arc<crate::ringbuf::RingBuffer<crate::data::Data>>> {
        self.ring.get()
    }

    pub fn describe(&self) -> Value {
        json!({
            "type": "rtmpConn",
            "id": self.id,
            "remoteAddr": self.remote_addr.to_string(),
            "state": self.safe_state().as_str(),
            "uptimeSeconds": self.created_at.elapsed().as_secs_f64(),
        })
    }
}

/// Cleans up exactly once regardless of which exit path through the
/// pipeline triggered it: early `?` returns can't skip a `Drop` impl.
pub struct RemovalGuard {
    armed: AtomicBool,
    action: Option<CleanupAction>,
}

enum CleanupAction {
    Reader { manager: Arc<PathManager>, path: Arc<Path>, author: String },
    Publisher { manager: Arc<PathManager>, path: Arc<Path>, author: String },
}

impl RemovalGuard {
    pub fn for_reader(manager: Arc<PathManager>, path: Arc<Path>, author: String) -> Self {
        Self { armed: AtomicBool::new(true), action: Some(CleanupAction::Reader { manager, path, author }) }
    }

    pub fn for_publisher(manager: Arc<PathManager>, path: Arc<Path>, author: String) -> Self {
        Self { armed: AtomicBool::new(true), action: Some(CleanupAction::Publisher { manager, path, author }) }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            if let Some(action) = self.action.take() {
                tokio::spawn(async move {
                    match action {
                        CleanupAction::Reader { manager, path, author } => {
                            manager.on_reader_remove(&path, &author).await;
                        }
                        CleanupAction::Publisher { manager, path, author } => {
                            manager.on_publisher_remove(&path, &author).await;
                        }
                    }
                });
            }
        }
    }
}

/// Lets an HTTP introspection layer observe connections without `conn`
/// depending on it: implemented by `web::shared::SharedState`.
pub trait ConnRegistry: Send + Sync {
    fn register(&self, conn: Arc<Connection>);
    fn unregister(&self, id: &str);
    /// Called once per connection that closed on a critical auth failure.
    fn record_auth_critical(&self);
}

/// Drives one connection end to end: spawns the inner protocol task, races
/// it against parent cancellation, and notifies the parent on close. This
/// is `runConn`/`runInner` from the design: a lifecycle task, an inner
/// task, and a watcher task that forces the socket closed on cancel.
pub async fn run(
    socket: TcpStream,
    remote_addr: SocketAddr,
    path_manager: Arc<PathManager>,
    settings: ConnSettings,
    parent_cancel: CancellationToken,
    registry: Option<Arc<dyn ConnRegistry>>,
) {
    let run_on_connect = settings.run_on_connect.clone();
    let rtsp_port = settings.rtsp_port;
    let conn = Arc::new(Connection::new(remote_addr, settings));
    let child_cancel = parent_cancel.child_token();

    if let Some(registry) = &registry {
        registry.register(conn.clone());
    }

    // spec.md 4.G/6: `runOnConnect` gets `{RTSP_PATH: "", RTSP_PORT: <port>}` —
    // the path isn't resolved yet at connect time, so `RTSP_PATH` is empty.
    let mut child_command = run_on_connect.map(|cmd| {
        crate::proc::ChildCommand::new(
            cmd,
            vec![("RTSP_PATH".to_string(), String::new()), ("RTSP_PORT".to_string(), rtsp_port.to_string())],
        )
    });
    if let Some(cmd) = &mut child_command {
        if let Err(e) = cmd.spawn() {
            warn!("conn {}: runOnConnect failed to spawn: {e}", conn.id());
        }
    }

    let shared_socket: crate::rtmp::framer::SharedSocket = Arc::new(tokio::sync::Mutex::new(socket));
    let watcher_cancel = child_cancel.clone();
    let watcher_handle = {
        let watcher_socket = shared_socket.clone();
        tokio::spawn(async move {
            watcher_cancel.cancelled().await;
            use tokio::io::AsyncWriteExt;
            let mut s = watcher_socket.lock().await;
            let _ = s.shutdown().await;
        })
    };

    let inner_conn = conn.clone();
    let inner_cancel = child_cancel.clone();
    let inner_path_manager = path_manager.clone();
    let inner_handle = tokio::spawn(async move {
        run_inner(inner_conn, shared_socket, inner_path_manager, inner_cancel).await
    });

    let result = tokio::select! {
        res = inner_handle => res.unwrap_or(Err(crate::error::ConnError::Terminated)),
        _ = parent_cancel.cancelled() => {
            child_cancel.cancel();
            Err(crate::error::ConnError::Terminated)
        }
    };

    watcher_handle.abort();
    if let Some(mut cmd) = child_command {
        cmd.shutdown().await;
    }
    if let Some(registry) = &registry {
        registry.unregister(conn.id());
    }

    match &result {
        Ok(()) => info!("conn {} closed", conn.id()),
        Err(e @ crate::error::ConnError::AuthCritical(_)) => {
            if let Some(registry) = &registry {
                registry.record_auth_critical();
            }
            info!("conn {} closed: {e}", conn.id());
        }
        Err(e) => info!("conn {} closed: {e}", conn.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Action, AuthRequest};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn settings() -> ConnSettings {
        ConnSettings {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            read_buffer_count: 16,
            run_on_connect: None,
            rtsp_port: 8554,
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000)
    }

    #[test]
    fn new_connection_starts_idle_with_no_path_or_ring() {
        let conn = Connection::new(addr(), settings());
        assert_eq!(conn.safe_state(), ConnState::Idle);
        assert!(conn.path().is_none());
        assert!(conn.ring().is_none());
        assert!(!conn.id().is_empty());
    }

    #[test]
    fn transition_moves_out_of_idle_exactly_once() {
        let conn = Connection::new(addr(), settings());
        conn.transition(ConnState::Publish);
        assert_eq!(conn.safe_state(), ConnState::Publish);
    }

    #[test]
    #[should_panic]
    fn transition_twice_is_rejected_in_debug_builds() {
        let conn = Connection::new(addr(), settings());
        conn.transition(ConnState::Read);
        conn.transition(ConnState::Publish);
    }

    #[test]
    fn describe_reports_current_state() {
        let conn = Connection::new(addr(), settings());
        conn.transition(ConnState::Read);
        let value = conn.describe();
        assert_eq!(value["type"], "rtmpConn");
        assert_eq!(value["state"], "read");
        assert_eq!(value["id"], conn.id());
    }

    #[tokio::test]
    async fn removal_guard_invokes_publisher_cleanup_exactly_once_on_drop() {
        let manager = Arc::new(PathManager::new(std::collections::HashMap::new()));
        let req = AuthRequest {
            path_name: "live/test".to_string(),
            action: Action::Publish,
            remote_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            query_user: String::new(),
            query_pass: String::new(),
            raw_query: String::new(),
        };
        let path = manager.on_publisher_announce("pub-1", &req).await.unwrap();

        {
            let _guard = RemovalGuard::for_publisher(manager.clone(), path.clone(), "pub-1".to_string());
        }
        // Drop spawns a detached cleanup task; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let path2 = manager.on_publisher_announce("pub-2", &req).await.unwrap();
        assert!(Arc::ptr_eq(&path, &path2));
    }
}

async fn run_inner(
    conn: Arc<Connection>,
    socket: crate::rtmp::framer::SharedSocket,
    path_manager: Arc<PathManager>,
    cancel: CancellationToken,
) -> Result<(), crate::error::ConnError> {
    let mut framer = crate::rtmp::framer::RtmpFramer::new(socket);
    framer.set_read_deadline(Some(Instant::now() + conn.settings.read_timeout));
    framer.set_write_deadline(Some(Instant::now() + conn.settings.write_timeout));

    tokio::select! {
        res = framer.server_handshake() => res?,
        _ = cancel.cancelled() => return Err(crate::error::ConnError::Terminated),
    }

    if framer.is_publishing() {
        publisher::run(conn, framer, path_manager, cancel).await
    } else {
        reader::run(conn, framer, path_manager, cancel).await
    }
}
