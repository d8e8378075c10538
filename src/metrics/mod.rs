//! EdgeMesh Metrics Module
//!
//! Prometheus-compatible metrics export and dashboard report snapshots
//! aggregated from the routing components.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::balancer::{BalancerStats, GlobalLoadBalancer};
use crate::failover::{FailoverManager, FailoverStats};
use crate::georouting::{GeoRouter, RouterMetrics};
use crate::registry::{EdgeRegistry, RegistryStats};

/// Dashboard snapshot; plain data, no wire-format compatibility promise.
#[derive(Debug, Clone, Serialize)]
pub struct MeshReport {
    pub generated_at: DateTime<Utc>,
    pub registry: RegistryStats,
    pub balancer: BalancerStats,
    pub router: RouterMetrics,
    pub failover: FailoverStats,
}

/// Metrics exporter over the component snapshots.
pub struct MeshMetricsExporter {
    registry: Arc<EdgeRegistry>,
    balancer: Arc<GlobalLoadBalancer>,
    router: Arc<GeoRouter>,
    failover: Arc<FailoverManager>,
}

impl MeshMetricsExporter {
    pub fn new(
        registry: Arc<EdgeRegistry>,
        balancer: Arc<GlobalLoadBalancer>,
        router: Arc<GeoRouter>,
        failover: Arc<FailoverManager>,
    ) -> Self {
        Self { registry, balancer, router, failover }
    }

    /// Generate Prometheus metrics
    pub fn prometheus_metrics(&self) -> String {
        let registry = self.registry.stats();
        let balancer = self.balancer.stats();
        let router = self.router.metrics();
        let failover = self.failover.stats();

        let mut output = String::new();

        // Registry metrics
        output.push_str("# HELP edgemesh_locations_total Registered edge locations\n");
        output.push_str("# TYPE edgemesh_locations_total gauge\n");
        output.push_str(&format!("edgemesh_locations_total {}\n", registry.total_locations));

        output.push_str("# HELP edgemesh_locations_enabled Enabled edge locations\n");
        output.push_str("# TYPE edgemesh_locations_enabled gauge\n");
        output.push_str(&format!("edgemesh_locations_enabled {}\n", registry.enabled_locations));

        output.push_str("# HELP edgemesh_locations_healthy Healthy edge locations\n");
        output.push_str("# TYPE edgemesh_locations_healthy gauge\n");
        output.push_str(&format!("edgemesh_locations_healthy {}\n", registry.healthy_locations));

        // Routing metrics
        output.push_str("# HELP edgemesh_routing_requests_total Routing decisions made\n");
        output.push_str("# TYPE edgemesh_routing_requests_total counter\n");
        output.push_str(&format!("edgemesh_routing_requests_total {}\n", router.total_requests));

        output.push_str("# HELP edgemesh_routing_fallback_total Requests routed to the fallback location\n");
        output.push_str("# TYPE edgemesh_routing_fallback_total counter\n");
        output.push_str(&format!("edgemesh_routing_fallback_total {}\n", router.fallback_routed));

        output.push_str("# HELP edgemesh_routing_rejected_total Requests rejected by rules\n");
        output.push_str("# TYPE edgemesh_routing_rejected_total counter\n");
        output.push_str(&format!("edgemesh_routing_rejected_total {}\n", router.rejected));

        output.push_str("# HELP edgemesh_geoip_lookups_total GeoIP lookups attempted\n");
        output.push_str("# TYPE edgemesh_geoip_lookups_total counter\n");
        output.push_str(&format!("edgemesh_geoip_lookups_total {}\n", router.geoip_lookups));

        output.push_str("# HELP edgemesh_geoip_errors_total GeoIP lookups failed\n");
        output.push_str("# TYPE edgemesh_geoip_errors_total counter\n");
        output.push_str(&format!("edgemesh_geoip_errors_total {}\n", router.geoip_errors));

        // Balancer metrics
        output.push_str("# HELP edgemesh_backends_total Registered backends\n");
        output.push_str("# TYPE edgemesh_backends_total gauge\n");
        output.push_str(&format!("edgemesh_backends_total {}\n", balancer.total_backends));

        output.push_str("# HELP edgemesh_backends_healthy Healthy backends\n");
        output.push_str("# TYPE edgemesh_backends_healthy gauge\n");
        output.push_str(&format!("edgemesh_backends_healthy {}\n", balancer.healthy_backends));

        output.push_str("# HELP edgemesh_backend_requests_total Requests recorded against backends\n");
        output.push_str("# TYPE edgemesh_backend_requests_total counter\n");
        output.push_str(&format!("edgemesh_backend_requests_total {}\n", balancer.total_requests));

        output.push_str("# HELP edgemesh_backend_requests_failed Failed backend requests\n");
        output.push_str("# TYPE edgemesh_backend_requests_failed counter\n");
        output.push_str(&format!("edgemesh_backend_requests_failed {}\n", balancer.failed_requests));

        // Failover metrics
        output.push_str("# HELP edgemesh_failovers_active Active region failovers\n");
        output.push_str("# TYPE edgemesh_failovers_active gauge\n");
        output.push_str(&format!("edgemesh_failovers_active {}\n", failover.active_failovers));

        output.push_str("# HELP edgemesh_failover_policies Failover policies configured\n");
        output.push_str("# TYPE edgemesh_failover_policies gauge\n");
        output.push_str(&format!("edgemesh_failover_policies {}\n", failover.policies));

        output.push_str("# HELP edgemesh_failover_events_unacked Unacknowledged failover events\n");
        output.push_str("# TYPE edgemesh_failover_events_unacked gauge\n");
        output.push_str(&format!("edgemesh_failover_events_unacked {}\n", failover.unacknowledged_events));

        output
    }

    /// Get metrics as JSON
    pub fn metrics_json(&self) -> serde_json::Value {
        let registry = self.registry.stats();
        let balancer = self.balancer.stats();
        let router = self.router.metrics();
        let failover = self.failover.stats();

        serde_json::json!({
            "locations": {
                "total": registry.total_locations,
                "enabled": registry.enabled_locations,
                "healthy": registry.healthy_locations,
            },
            "routing": {
                "requests": router.total_requests,
                "fallback": router.fallback_routed,
                "rejected": router.rejected,
                "geoip_lookups": router.geoip_lookups,
                "geoip_errors": router.geoip_errors,
            },
            "backends": {
                "total": balancer.total_backends,
                "healthy": balancer.healthy_backends,
                "requests": balancer.total_requests,
                "failed": balancer.failed_requests,
            },
            "failover": {
                "state": failover.state,
                "active": failover.active_failovers,
                "policies": failover.policies,
            },
        })
    }

    /// Full dashboard snapshot.
    pub fn generate_report(&self) -> MeshReport {
        MeshReport {
            generated_at: Utc::now(),
            registry: self.registry.stats(),
            balancer: self.balancer.stats(),
            router: self.router.metrics(),
            failover: self.failover.stats(),
        }
    }
}
