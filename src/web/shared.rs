//! Shared state for the HTTP introspection server: configuration, the live
//! connection registry, and the metrics handle.

use crate::conn::{ConnRegistry, Connection};
use crate::config::Config;
use crate::web::metrics::EngineMetrics;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared state handed to every HTTP route.
#[derive(Clone)]
pub struct SharedState {
    pub config: Arc<Config>,
    pub metrics: Arc<EngineMetrics>,
    registry: Arc<Mutex<HashMap<String, Arc<Connection>>>>,
    start_time: Instant,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").field("config", &self.config).field("connections", &self.connection_count()).finish()
    }
}

impl SharedState {
    pub fn new(config: Config, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            config: Arc::new(config),
            metrics,
            registry: Arc::new(Mutex::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    pub fn list(&self) -> Vec<Value> {
        self.registry.lock().unwrap().values().map(|c| c.describe()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.registry.lock().unwrap().get(id).map(|c| c.describe())
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl ConnRegistry for SharedState {
    fn register(&self, conn: Arc<Connection>) {
        self.registry.lock().unwrap().insert(conn.id().to_string(), conn);
        self.metrics.connections_total.inc();
        self.metrics.connections_active.set(self.connection_count() as i64);
    }

    fn unregister(&self, id: &str) {
        self.registry.lock().unwrap().remove(id);
        self.metrics.connections_active.set(self.connection_count() as i64);
    }

    fn record_auth_critical(&self) {
        self.metrics.auth_critical_total.inc();
    }
}
