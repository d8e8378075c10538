//! EdgeMesh - Edge Traffic Routing & Failover Control Plane
//!
//! A routing control plane for globally distributed edge platforms with:
//! - Geographic edge-location registry with health-aware scoring
//! - Latency-optimized location ranking from live probe data
//! - Priority-ordered geo routing rules (GeoIP, headers, path, tenant)
//! - Global load balancing across backend pools
//! - Automatic two-way region failover and recovery

pub mod registry;
pub mod latency;
pub mod georouting;
pub mod balancer;
pub mod failover;
pub mod metrics;

use std::sync::Arc;
use thiserror::Error;

pub use registry::{
    EdgeLocation, EdgeProbe, EdgeRegistry, EdgeStatus, GeoPoint, HealthMonitor,
    HealthMonitorConfig, ProbeError, RegistryConfig, RegistryError, ScoringWeights,
    SelectOptions,
};
pub use latency::{
    LatencyBudget, LatencyConfig, LatencyError, LatencyMeasurement, LatencyOptimizer,
    LatencyProbe, LatencyProber, LatencyStats, RankedLocation, RankingWeights,
};
pub use georouting::{
    ConditionField, ConditionOp, GeoIpInfo, GeoIpLookup, GeoRouter, GeoRouterConfig,
    GeoRoutingError, RoutingAction, RoutingCondition, RoutingRequest, RoutingResult,
    RoutingRule, WeightedTarget,
};
pub use balancer::{
    Backend, BackendHealthCheck, BackendState, BalancerConfig, BalancerError,
    BalancingAlgorithm, GlobalLoadBalancer, RequestContext,
};
pub use failover::{
    ActiveFailover, FailoverConfig, FailoverError, FailoverEvent, FailoverEventType,
    FailoverManager, FailoverPolicy, FailoverState, NoopTrafficSwitch, RegionHealth,
    TrafficSwitch,
};
pub use metrics::{MeshMetricsExporter, MeshReport};

/// EdgeMesh errors
#[derive(Error, Debug)]
pub enum EdgeMeshError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Latency error: {0}")]
    Latency(#[from] LatencyError),
    #[error("Routing error: {0}")]
    Routing(#[from] GeoRoutingError),
    #[error("Balancer error: {0}")]
    Balancer(#[from] BalancerError),
    #[error("Failover error: {0}")]
    Failover(#[from] FailoverError),
}

/// EdgeMesh configuration
#[derive(Debug, Clone)]
pub struct EdgeMeshConfig {
    pub registry: RegistryConfig,
    pub latency: LatencyConfig,
    pub router: GeoRouterConfig,
    pub balancer: BalancerConfig,
    pub failover: FailoverConfig,
    /// Refine non-rule routing decisions through the latency optimizer.
    pub latency_aware_fallback: bool,
}

impl Default for EdgeMeshConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            latency: LatencyConfig::default(),
            router: GeoRouterConfig::default(),
            balancer: BalancerConfig::default(),
            failover: FailoverConfig::default(),
            latency_aware_fallback: true,
        }
    }
}

/// Main EdgeMesh control-plane instance.
pub struct EdgeMesh {
    pub config: EdgeMeshConfig,
    pub registry: Arc<EdgeRegistry>,
    pub optimizer: Arc<LatencyOptimizer>,
    pub router: Arc<GeoRouter>,
    pub balancer: Arc<GlobalLoadBalancer>,
    pub failover: Arc<FailoverManager>,
    pub exporter: MeshMetricsExporter,
}

impl EdgeMesh {
    /// Create an EdgeMesh instance with no GeoIP lookup and a logging-only
    /// traffic switch.
    pub fn new(config: EdgeMeshConfig) -> Self {
        Self::with_collaborators(config, None, Arc::new(NoopTrafficSwitch))
    }

    /// Create an EdgeMesh instance with injected collaborators.
    pub fn with_collaborators(
        config: EdgeMeshConfig,
        geoip: Option<Arc<dyn GeoIpLookup>>,
        switch: Arc<dyn TrafficSwitch>,
    ) -> Self {
        let registry = Arc::new(EdgeRegistry::new(config.registry.clone()));
        let optimizer = Arc::new(LatencyOptimizer::new(config.latency.clone(), Arc::clone(&registry)));
        let router = Arc::new(GeoRouter::new(config.router.clone(), Arc::clone(&registry), geoip));
        let balancer = Arc::new(GlobalLoadBalancer::new(config.balancer.clone(), Arc::clone(&registry)));
        let failover = Arc::new(FailoverManager::new(config.failover.clone(), Arc::clone(&registry), switch));
        let exporter = MeshMetricsExporter::new(
            Arc::clone(&registry),
            Arc::clone(&balancer),
            Arc::clone(&router),
            Arc::clone(&failover),
        );

        Self {
            config,
            registry,
            optimizer,
            router,
            balancer,
            failover,
            exporter,
        }
    }

    /// Route a request to an edge location.
    ///
    /// Rules decide first; rule-less decisions are optionally refined by
    /// the latency ranking; finally any active failover substitutes the
    /// target region for the chosen location's region.
    pub fn route(&self, request: &RoutingRequest) -> Result<RoutingResult, EdgeMeshError> {
        let mut result = self.router.route(request)?;

        if self.config.latency_aware_fallback && result.rule_id.is_none() {
            if let Some((lat, lon)) = Self::request_coords(request, &result) {
                let refined = self.optimizer
                    .rank_locations(lat, lon, &RankingWeights::default())
                    .into_iter()
                    .find(|r| {
                        self.registry.get_status(&r.location_id)
                            .map(|s| s.healthy)
                            .unwrap_or(false)
                    });
                if let Some(best) = refined {
                    if best.location_id != result.location_id {
                        result.reason = format!(
                            "{} refined to {} by latency ranking",
                            result.reason, best.location_id
                        );
                        result.location_id = best.location_id;
                    }
                }
            }
        }

        // Active failovers transparently redirect the chosen region.
        if let Some(location) = self.registry.get_location(&result.location_id) {
            let target_region = self.failover.current_target(&location.region);
            if target_region != location.region {
                let reference = Self::request_coords(request, &result)
                    .unwrap_or((location.latitude, location.longitude));
                let opts = SelectOptions {
                    required_region: Some(target_region.clone()),
                    ..Default::default()
                };
                if let Some(substitute) = self.registry.select_location(reference.0, reference.1, &opts) {
                    result.reason = format!(
                        "{}; region {} failed over to {}",
                        result.reason, location.region, target_region
                    );
                    result.location_id = substitute.id;
                }
            }
        }

        Ok(result)
    }

    /// Pick a concrete backend inside the platform for a proxied request.
    pub fn select_backend(&self, ctx: &RequestContext) -> Result<Backend, EdgeMeshError> {
        Ok(self.balancer.select_backend(ctx)?)
    }

    /// Where traffic for a region should go right now.
    pub fn current_target(&self, region: &str) -> String {
        self.failover.current_target(region)
    }

    /// Full dashboard snapshot.
    pub fn generate_report(&self) -> MeshReport {
        self.exporter.generate_report()
    }

    fn request_coords(request: &RoutingRequest, result: &RoutingResult) -> Option<(f64, f64)> {
        match (request.latitude, request.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => result.geo.as_ref().and_then(|g| match (g.latitude, g.longitude) {
                (Some(lat), Some(lon)) => Some((lat, lon)),
                _ => None,
            }),
        }
    }
}
