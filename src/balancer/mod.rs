//! EdgeMesh Global Load Balancer
//!
//! Flat backend pool (host:port units, distinct from edge locations) with
//! pluggable selection algorithms and a background health-check loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::registry::{EdgeRegistry, GeoPoint};

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Invalid backend: {0}")]
    Validation(String),
    #[error("Backend not found: {0}")]
    NotFound(String),
    #[error("No healthy backends available")]
    NoHealthyBackends,
}

/// Backend lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Healthy,
    Unhealthy,
    Draining,
    Disabled,
}

/// A concrete network endpoint in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub region: String,
    /// Cross-reference into the edge registry for geo-proximity selection.
    pub location_id: Option<String>,
    pub state: BackendState,
    pub active_conns: i64,
    pub total_conns: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
}

impl Backend {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            weight: 1,
            region: String::new(),
            location_id: None,
            state: BackendState::Healthy,
            active_conns: 0,
            total_conns: 0,
            total_requests: 0,
            failed_requests: 0,
            avg_response_time_ms: 0.0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }
}

/// Selection algorithm for `select_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    GeoProximity,
    Random,
}

/// Per-request context for backend selection.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Balancer configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub algorithm: BalancingAlgorithm,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Seed for the random algorithm; pinned in tests.
    pub rng_seed: Option<u64>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalancingAlgorithm::RoundRobin,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(3),
            rng_seed: None,
        }
    }
}

/// Injected backend health check; real implementations issue TCP or HTTP
/// probes against the backend address.
#[async_trait]
pub trait BackendHealthCheck: Send + Sync {
    async fn check(&self, backend: &Backend) -> bool;
}

/// Closure adapter for tests and small hosts.
pub struct FnHealthCheck<F>(pub F);

#[async_trait]
impl<F, Fut> BackendHealthCheck for FnHealthCheck<F>
where
    F: Fn(Backend) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    async fn check(&self, backend: &Backend) -> bool {
        (self.0)(backend.clone()).await
    }
}

/// Balancer snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub draining_backends: usize,
    pub disabled_backends: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
}

/// Global load balancer over a flat backend pool.
pub struct GlobalLoadBalancer {
    config: BalancerConfig,
    registry: Arc<EdgeRegistry>,
    backends: Arc<DashMap<String, Backend>>,
    rr_index: AtomicU64,
    wrr_index: AtomicU64,
    rng: Mutex<StdRng>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GlobalLoadBalancer {
    pub fn new(config: BalancerConfig, registry: Arc<EdgeRegistry>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            registry,
            backends: Arc::new(DashMap::new()),
            rr_index: AtomicU64::new(0),
            wrr_index: AtomicU64::new(0),
            rng: Mutex::new(rng),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn register_backend(&self, backend: Backend) -> Result<(), BalancerError> {
        if backend.id.is_empty() {
            return Err(BalancerError::Validation("backend id must not be empty".into()));
        }
        info!(backend = %backend.id, address = %backend.address, port = backend.port, "Registered backend");
        self.backends.insert(backend.id.clone(), backend);
        Ok(())
    }

    pub fn remove_backend(&self, id: &str) -> Result<Backend, BalancerError> {
        self.backends.remove(id)
            .map(|(_, b)| b)
            .ok_or_else(|| BalancerError::NotFound(id.to_string()))
    }

    pub fn get_backend(&self, id: &str) -> Option<Backend> {
        self.backends.get(id).map(|b| b.clone())
    }

    pub fn get_backends(&self) -> Vec<Backend> {
        self.backends.iter().map(|b| b.clone()).collect()
    }

    pub fn set_backend_state(&self, id: &str, state: BackendState) -> Result<(), BalancerError> {
        let mut backend = self.backends.get_mut(id)
            .ok_or_else(|| BalancerError::NotFound(id.to_string()))?;
        backend.state = state;
        info!(backend = %id, state = ?state, "Backend state changed");
        Ok(())
    }

    /// Take a backend out of rotation while letting its connections finish.
    pub fn drain_backend(&self, id: &str) -> Result<(), BalancerError> {
        self.set_backend_state(id, BackendState::Draining)
    }

    /// Pick a backend via the configured algorithm.
    ///
    /// An empty healthy set is always an error; it never silently defaults.
    pub fn select_backend(&self, ctx: &RequestContext) -> Result<Backend, BalancerError> {
        // Stable id order keeps index-based algorithms deterministic.
        let mut healthy: Vec<Backend> = self.backends.iter()
            .filter(|b| b.state == BackendState::Healthy)
            .map(|b| b.clone())
            .collect();
        healthy.sort_by(|a, b| a.id.cmp(&b.id));

        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyBackends);
        }

        let selected = match self.config.algorithm {
            BalancingAlgorithm::RoundRobin => self.round_robin(&healthy),
            BalancingAlgorithm::WeightedRoundRobin => self.weighted_round_robin(&healthy),
            BalancingAlgorithm::LeastConnections => Self::least_connections(&healthy),
            BalancingAlgorithm::LeastResponseTime => Self::least_response_time(&healthy),
            BalancingAlgorithm::IpHash => self.ip_hash(&healthy, ctx),
            BalancingAlgorithm::GeoProximity => self.geo_proximity(&healthy, ctx),
            BalancingAlgorithm::Random => {
                let idx = self.rng.lock().gen_range(0..healthy.len());
                healthy[idx].clone()
            }
        };
        debug!(backend = %selected.id, algorithm = ?self.config.algorithm, "Selected backend");
        Ok(selected)
    }

    fn round_robin(&self, healthy: &[Backend]) -> Backend {
        let idx = self.rr_index.fetch_add(1, Ordering::Relaxed) as usize % healthy.len();
        healthy[idx].clone()
    }

    fn weighted_round_robin(&self, healthy: &[Backend]) -> Backend {
        let total: u64 = healthy.iter().map(|b| b.weight as u64).sum();
        if total == 0 {
            return self.round_robin(healthy);
        }
        let mut slot = self.wrr_index.fetch_add(1, Ordering::Relaxed) % total;
        for backend in healthy {
            let weight = backend.weight as u64;
            if slot < weight {
                return backend.clone();
            }
            slot -= weight;
        }
        healthy[healthy.len() - 1].clone()
    }

    // Ties keep the earliest candidate, which is the lowest id after the
    // stable sort in select_backend.
    fn least_connections(healthy: &[Backend]) -> Backend {
        let mut best = &healthy[0];
        for backend in &healthy[1..] {
            if backend.active_conns < best.active_conns {
                best = backend;
            }
        }
        best.clone()
    }

    fn least_response_time(healthy: &[Backend]) -> Backend {
        let mut best: Option<&Backend> = None;
        for backend in healthy {
            if backend.avg_response_time_ms <= 0.0 {
                continue;
            }
            let faster = match best {
                None => true,
                Some(b) => backend.avg_response_time_ms < b.avg_response_time_ms,
            };
            if faster {
                best = Some(backend);
            }
        }
        match best {
            Some(backend) => backend.clone(),
            // No response-time data anywhere yet.
            None => Self::least_connections(healthy),
        }
    }

    /// Polynomial hash of the client IP; stable across calls and process
    /// restarts (no per-process salt).
    fn ip_hash(&self, healthy: &[Backend], ctx: &RequestContext) -> Backend {
        let ip = match &ctx.client_ip {
            Some(ip) if !ip.is_empty() => ip,
            _ => return self.round_robin(healthy),
        };
        let mut hash: u64 = 0;
        for byte in ip.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
        }
        healthy[(hash % healthy.len() as u64) as usize].clone()
    }

    /// Nearest backend by the haversine distance to its resolved edge
    /// location; backends with a dangling or missing location reference
    /// are skipped.
    fn geo_proximity(&self, healthy: &[Backend], ctx: &RequestContext) -> Backend {
        let (lat, lon) = match (ctx.latitude, ctx.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return self.round_robin(healthy),
        };
        let from = GeoPoint::new(lat, lon);

        let mut best: Option<(f64, &Backend)> = None;
        for backend in healthy {
            let location = backend.location_id.as_deref()
                .and_then(|id| self.registry.get_location(id));
            let location = match location {
                Some(l) => l,
                None => continue,
            };
            let distance = from.distance_to(&location.point());
            let closer = match &best {
                None => true,
                Some((best_dist, _)) => distance < *best_dist,
            };
            if closer {
                best = Some((distance, backend));
            }
        }

        match best {
            Some((_, backend)) => backend.clone(),
            // No backend resolves to a location; degrade to round robin.
            None => self.round_robin(healthy),
        }
    }

    /// Record the outcome of a proxied request.
    ///
    /// Response time feeds an exponential moving average (alpha = 0.1);
    /// the very first sample is assigned directly.
    pub fn record_request(&self, id: &str, success: bool, response_time: Duration) -> Result<(), BalancerError> {
        let mut backend = self.backends.get_mut(id)
            .ok_or_else(|| BalancerError::NotFound(id.to_string()))?;
        backend.total_requests += 1;
        if !success {
            backend.failed_requests += 1;
        }
        let sample_ms = response_time.as_secs_f64() * 1000.0;
        if backend.avg_response_time_ms == 0.0 {
            backend.avg_response_time_ms = sample_ms;
        } else {
            backend.avg_response_time_ms = backend.avg_response_time_ms * 0.9 + sample_ms * 0.1;
        }
        Ok(())
    }

    /// Connection counters are a caller contract; mismatched calls can go
    /// negative and are not defended against.
    pub fn increment_connections(&self, id: &str) {
        if let Some(mut backend) = self.backends.get_mut(id) {
            backend.active_conns += 1;
            backend.total_conns += 1;
        }
    }

    pub fn decrement_connections(&self, id: &str) {
        if let Some(mut backend) = self.backends.get_mut(id) {
            backend.active_conns -= 1;
        }
    }

    /// Start the health-check loop. Calling start on a running balancer is
    /// a no-op.
    pub fn start_health_checks(&self, checker: Arc<dyn BackendHealthCheck>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);

        let backends = Arc::clone(&self.backends);
        let interval = self.config.health_check_interval;
        let timeout = self.config.health_check_timeout;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_sweep(&backends, &checker, timeout).await;
                    }
                    _ = rx.changed() => {
                        info!("Backend health checks stopping");
                        break;
                    }
                }
            }
        }));
        info!(interval_secs = interval.as_secs(), "Backend health checks started");
    }

    /// One health sweep: probe every non-disabled backend concurrently and
    /// flip Healthy/Unhealthy only; Draining and Disabled are untouched.
    async fn run_sweep(backends: &DashMap<String, Backend>, checker: &Arc<dyn BackendHealthCheck>, timeout: Duration) {
        let mut tasks: JoinSet<(String, bool)> = JoinSet::new();
        for backend in backends.iter() {
            if backend.state == BackendState::Disabled {
                continue;
            }
            let snapshot = backend.clone();
            let checker = Arc::clone(checker);
            tasks.spawn(async move {
                let healthy = tokio::time::timeout(timeout, checker.check(&snapshot))
                    .await
                    .unwrap_or(false);
                (snapshot.id, healthy)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, healthy) = match joined {
                Ok(result) => result,
                Err(_) => continue, // one panicked probe must not kill the sweep
            };
            if let Some(mut backend) = backends.get_mut(&id) {
                match (backend.state, healthy) {
                    (BackendState::Healthy, false) => {
                        warn!(backend = %id, "Backend became unhealthy");
                        backend.state = BackendState::Unhealthy;
                    }
                    (BackendState::Unhealthy, true) => {
                        info!(backend = %id, "Backend recovered");
                        backend.state = BackendState::Healthy;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Run a single health sweep immediately, outside the ticker.
    pub async fn sweep_once(&self, checker: Arc<dyn BackendHealthCheck>) {
        Self::run_sweep(&self.backends, &checker, self.config.health_check_timeout).await;
    }

    /// Stop the health-check loop and wait for it to exit. Safe to call once.
    pub async fn stop_health_checks(&self) {
        let tx = self.stop_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> BalancerStats {
        let mut stats = BalancerStats {
            total_backends: 0,
            healthy_backends: 0,
            draining_backends: 0,
            disabled_backends: 0,
            total_requests: 0,
            failed_requests: 0,
        };
        for backend in self.backends.iter() {
            stats.total_backends += 1;
            match backend.state {
                BackendState::Healthy => stats.healthy_backends += 1,
                BackendState::Draining => stats.draining_backends += 1,
                BackendState::Disabled => stats.disabled_backends += 1,
                BackendState::Unhealthy => {}
            }
            stats.total_requests += backend.total_requests;
            stats.failed_requests += backend.failed_requests;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EdgeLocation, RegistryConfig};

    fn balancer(algorithm: BalancingAlgorithm) -> GlobalLoadBalancer {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        GlobalLoadBalancer::new(
            BalancerConfig { algorithm, rng_seed: Some(11), ..Default::default() },
            registry,
        )
    }

    fn backend(id: &str) -> Backend {
        Backend::new(id, format!("{id}.internal"), 8080)
    }

    #[test]
    fn test_no_healthy_backends_is_an_error() {
        let lb = balancer(BalancingAlgorithm::RoundRobin);
        assert!(matches!(
            lb.select_backend(&RequestContext::default()),
            Err(BalancerError::NoHealthyBackends)
        ));

        lb.register_backend(backend("a")).unwrap();
        lb.set_backend_state("a", BackendState::Draining).unwrap();
        assert!(matches!(
            lb.select_backend(&RequestContext::default()),
            Err(BalancerError::NoHealthyBackends)
        ));
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = balancer(BalancingAlgorithm::RoundRobin);
        lb.register_backend(backend("a")).unwrap();
        lb.register_backend(backend("b")).unwrap();
        lb.register_backend(backend("c")).unwrap();

        let picks: Vec<String> = (0..6)
            .map(|_| lb.select_backend(&RequestContext::default()).unwrap().id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_weighted_round_robin_converges() {
        let lb = balancer(BalancingAlgorithm::WeightedRoundRobin);
        lb.register_backend(backend("heavy").with_weight(3)).unwrap();
        lb.register_backend(backend("light").with_weight(1)).unwrap();

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..400 {
            let picked = lb.select_backend(&RequestContext::default()).unwrap();
            *counts.entry(picked.id).or_insert(0) += 1;
        }
        assert_eq!(counts["heavy"], 300);
        assert_eq!(counts["light"], 100);
    }

    #[test]
    fn test_least_connections() {
        let lb = balancer(BalancingAlgorithm::LeastConnections);
        lb.register_backend(backend("busy")).unwrap();
        lb.register_backend(backend("idle")).unwrap();

        lb.increment_connections("busy");
        lb.increment_connections("busy");

        let picked = lb.select_backend(&RequestContext::default()).unwrap();
        assert_eq!(picked.id, "idle");
    }

    #[test]
    fn test_least_response_time_falls_back() {
        let lb = balancer(BalancingAlgorithm::LeastResponseTime);
        lb.register_backend(backend("a")).unwrap();
        lb.register_backend(backend("b")).unwrap();

        // No response data yet: behaves like least-connections.
        lb.increment_connections("a");
        assert_eq!(lb.select_backend(&RequestContext::default()).unwrap().id, "b");

        lb.record_request("a", true, Duration::from_millis(10)).unwrap();
        lb.record_request("b", true, Duration::from_millis(200)).unwrap();
        assert_eq!(lb.select_backend(&RequestContext::default()).unwrap().id, "a");
    }

    #[test]
    fn test_ip_hash_is_deterministic() {
        let lb = balancer(BalancingAlgorithm::IpHash);
        lb.register_backend(backend("a")).unwrap();
        lb.register_backend(backend("b")).unwrap();
        lb.register_backend(backend("c")).unwrap();

        let ctx = RequestContext { client_ip: Some("203.0.113.7".into()), ..Default::default() };
        let first = lb.select_backend(&ctx).unwrap().id;
        for _ in 0..20 {
            assert_eq!(lb.select_backend(&ctx).unwrap().id, first);
        }

        // The polynomial hash has no per-process salt.
        let mut hash: u64 = 0;
        for byte in "203.0.113.7".bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
        }
        let expected = ["a", "b", "c"][(hash % 3) as usize];
        assert_eq!(first, expected);
    }

    #[test]
    fn test_geo_proximity_skips_dangling_locations() {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        registry.register_location(EdgeLocation::new("nyc", "us-east", 40.71, -74.00)).unwrap();
        registry.register_location(EdgeLocation::new("london", "eu-west", 51.51, -0.13)).unwrap();

        let lb = GlobalLoadBalancer::new(
            BalancerConfig { algorithm: BalancingAlgorithm::GeoProximity, ..Default::default() },
            registry,
        );
        lb.register_backend(backend("near").with_location("nyc")).unwrap();
        lb.register_backend(backend("far").with_location("london")).unwrap();
        lb.register_backend(backend("dangling").with_location("ghost")).unwrap();

        let ctx = RequestContext {
            latitude: Some(40.7),
            longitude: Some(-74.0),
            ..Default::default()
        };
        assert_eq!(lb.select_backend(&ctx).unwrap().id, "near");

        // No coordinates: degrade to round robin, never an error.
        assert!(lb.select_backend(&RequestContext::default()).is_ok());
    }

    #[test]
    fn test_ema_response_time() {
        let lb = balancer(BalancingAlgorithm::RoundRobin);
        lb.register_backend(backend("a")).unwrap();

        lb.record_request("a", true, Duration::from_millis(100)).unwrap();
        // First sample is assigned, not averaged.
        assert_eq!(lb.get_backend("a").unwrap().avg_response_time_ms, 100.0);

        lb.record_request("a", false, Duration::from_millis(200)).unwrap();
        let b = lb.get_backend("a").unwrap();
        assert!((b.avg_response_time_ms - 110.0).abs() < 1e-9);
        assert_eq!(b.total_requests, 2);
        assert_eq!(b.failed_requests, 1);
    }

    #[test]
    fn test_unknown_backend_is_not_found() {
        let lb = balancer(BalancingAlgorithm::RoundRobin);
        assert!(matches!(lb.remove_backend("ghost"), Err(BalancerError::NotFound(_))));
        assert!(matches!(
            lb.record_request("ghost", true, Duration::from_millis(1)),
            Err(BalancerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_sweep_transitions() {
        let lb = balancer(BalancingAlgorithm::RoundRobin);
        lb.register_backend(backend("up")).unwrap();
        lb.register_backend(backend("down")).unwrap();
        lb.register_backend(backend("draining")).unwrap();
        lb.drain_backend("draining").unwrap();

        let checker = Arc::new(FnHealthCheck(|b: Backend| async move { b.id == "up" }));
        lb.sweep_once(checker.clone()).await;

        assert_eq!(lb.get_backend("up").unwrap().state, BackendState::Healthy);
        assert_eq!(lb.get_backend("down").unwrap().state, BackendState::Unhealthy);
        // Automatic checks never touch draining backends.
        assert_eq!(lb.get_backend("draining").unwrap().state, BackendState::Draining);

        // Recovery flips unhealthy back to healthy.
        let all_up = Arc::new(FnHealthCheck(|_: Backend| async move { true }));
        lb.sweep_once(all_up).await;
        assert_eq!(lb.get_backend("down").unwrap().state, BackendState::Healthy);
    }

    #[tokio::test]
    async fn test_health_loop_start_stop() {
        let lb = balancer(BalancingAlgorithm::RoundRobin);
        lb.register_backend(backend("a")).unwrap();

        let checker = Arc::new(FnHealthCheck(|_: Backend| async move { false }));
        lb.start_health_checks(checker);
        tokio::time::sleep(Duration::from_millis(30)).await;
        lb.stop_health_checks().await;
    }
}
