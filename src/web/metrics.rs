//! Prometheus metrics for the connection engine, exposed at `/metrics`.

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct EngineMetrics {
    pub connections_active: IntGauge,
    pub connections_total: IntCounter,
    pub auth_critical_total: IntCounter,
    registry: Registry,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_active =
            IntGauge::new("rtmp_conn_engine_connections_active", "Currently open RTMP connections")?;
        let connections_total =
            IntCounter::new("rtmp_conn_engine_connections_total", "Total RTMP connections accepted")?;
        let auth_critical_total = IntCounter::new(
            "rtmp_conn_engine_auth_critical_total",
            "Total critical authentication failures",
        )?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(auth_critical_total.clone()))?;

        Ok(Self { connections_active, connections_total, auth_critical_total, registry })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_survive_a_connect_disconnect_cycle() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.connections_active.dec();

        assert_eq!(metrics.connections_total.get(), 1);
        assert_eq!(metrics.connections_active.get(), 0);
        assert!(metrics.render().contains("rtmp_conn_engine_connections_total"));
    }
}
