//! EdgeMesh Latency Optimizer
//!
//! Rolling latency measurement windows per location, derived percentile
//! statistics, latency-aware location ranking, and an auto-probe loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::registry::{EdgeRegistry, GeoPoint, ProbeError};

#[derive(Error, Debug)]
pub enum LatencyError {
    #[error("Location not found: {0}")]
    NotFound(String),
}

/// One probe result for a location.
#[derive(Debug, Clone)]
pub struct LatencyMeasurement {
    pub location_id: String,
    pub latency: Duration,
    pub timestamp: Instant,
    pub success: bool,
    pub error: Option<String>,
}

/// Statistics derived from the current measurement window.
///
/// Latency figures are in milliseconds, computed over successful samples
/// only; `success_rate` covers the whole window.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub std_dev_ms: f64,
    pub success_rate: f64,
    pub sample_count: usize,
    pub last_updated: Option<Instant>,
}

/// Weights for the ranking score.
#[derive(Debug, Clone)]
pub struct RankingWeights {
    pub latency_weight: f64,
    pub distance_weight: f64,
    pub capacity_weight: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            latency_weight: 0.5,
            distance_weight: 0.3,
            capacity_weight: 0.2,
        }
    }
}

/// Transient ranking result; produced fresh per call, never stored.
#[derive(Debug, Clone)]
pub struct RankedLocation {
    pub location_id: String,
    pub latency_score: f64,
    pub distance_score: f64,
    pub capacity_score: f64,
    pub total_score: f64,
    pub estimated_latency_ms: f64,
}

/// Latency SLO thresholds for `meets_budget`.
#[derive(Debug, Clone)]
pub struct LatencyBudget {
    pub max_p50_ms: f64,
    pub max_p99_ms: f64,
    pub min_success_rate: f64,
}

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Measurement ring bound per location.
    pub max_samples: usize,
    /// Measurements older than this are evicted.
    pub sample_window: Duration,
    /// Stats are only derived once this many samples exist.
    pub min_samples_for_stats: usize,
    /// Stats older than this are considered unreliable.
    pub stale_threshold: Duration,
    /// Latency used to normalize the latency score.
    pub max_latency: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            max_samples: 100,
            sample_window: Duration::from_secs(300),
            min_samples_for_stats: 5,
            stale_threshold: Duration::from_secs(120),
            max_latency: Duration::from_millis(500),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
///
/// Index is `floor(p * n / 100)` clamped to the last element; no
/// interpolation. An empty slice yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p * sorted.len() as f64 / 100.0).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Latency optimizer over the shared location registry.
pub struct LatencyOptimizer {
    config: LatencyConfig,
    registry: Arc<EdgeRegistry>,
    measurements: DashMap<String, Vec<LatencyMeasurement>>,
    stats: DashMap<String, LatencyStats>,
}

impl LatencyOptimizer {
    pub fn new(config: LatencyConfig, registry: Arc<EdgeRegistry>) -> Self {
        Self {
            config,
            registry,
            measurements: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LatencyConfig {
        &self.config
    }

    /// Append a measurement, evict expired/excess samples, refresh stats.
    pub fn record_measurement(&self, measurement: LatencyMeasurement) {
        let id = measurement.location_id.clone();
        let mut window = self.measurements.entry(id.clone()).or_insert_with(Vec::new);

        window.push(measurement);

        // Evict by age first, then by count.
        let cutoff = Instant::now() - self.config.sample_window;
        window.retain(|m| m.timestamp > cutoff);
        if window.len() > self.config.max_samples {
            let excess = window.len() - self.config.max_samples;
            window.drain(0..excess);
        }

        if window.len() >= self.config.min_samples_for_stats {
            let stats = Self::compute_stats(&window);
            drop(window);
            self.stats.insert(id, stats);
        }
    }

    fn compute_stats(window: &[LatencyMeasurement]) -> LatencyStats {
        let mut ok_ms: Vec<f64> = window.iter()
            .filter(|m| m.success)
            .map(|m| m.latency.as_secs_f64() * 1000.0)
            .collect();
        ok_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let success_rate = ok_ms.len() as f64 / window.len() as f64;

        if ok_ms.is_empty() {
            return LatencyStats {
                success_rate,
                sample_count: window.len(),
                last_updated: Some(Instant::now()),
                ..Default::default()
            };
        }

        let avg = ok_ms.iter().sum::<f64>() / ok_ms.len() as f64;
        let variance = ok_ms.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / ok_ms.len() as f64;

        LatencyStats {
            min_ms: ok_ms[0],
            max_ms: ok_ms[ok_ms.len() - 1],
            avg_ms: avg,
            p50_ms: percentile(&ok_ms, 50.0),
            p90_ms: percentile(&ok_ms, 90.0),
            p99_ms: percentile(&ok_ms, 99.0),
            std_dev_ms: variance.sqrt(),
            success_rate,
            sample_count: window.len(),
            last_updated: Some(Instant::now()),
        }
    }

    pub fn get_stats(&self, location_id: &str) -> Option<LatencyStats> {
        self.stats.get(location_id).map(|s| s.clone())
    }

    pub fn sample_count(&self, location_id: &str) -> usize {
        self.measurements.get(location_id).map(|w| w.len()).unwrap_or(0)
    }

    /// Rank every enabled location for a caller at the given coordinates.
    ///
    /// Locations without latency data score on distance alone (scaled to
    /// 0.8 as a proxy penalty) with latency estimated at distance/300 ms.
    /// Result is sorted by total score descending, ties on lowest id.
    pub fn rank_locations(&self, latitude: f64, longitude: f64, weights: &RankingWeights) -> Vec<RankedLocation> {
        let from = GeoPoint::new(latitude, longitude);
        let max_latency_ms = self.config.max_latency.as_secs_f64() * 1000.0;
        let max_distance_km = self.registry.config().max_distance_km;

        let mut ranked: Vec<RankedLocation> = self.registry.get_enabled_locations()
            .into_iter()
            .map(|location| {
                let distance = from.distance_to(&location.point());
                let distance_score = (1.0 - distance / max_distance_km).max(0.0);

                let (latency_score, estimated_latency_ms) = match self.get_stats(&location.id) {
                    Some(stats) if stats.last_updated.is_some() && stats.success_rate > 0.0 => {
                        let score = (1.0 - stats.p50_ms / max_latency_ms).max(0.0) * stats.success_rate;
                        (score, stats.p50_ms)
                    }
                    // No usable data: distance is the latency proxy.
                    _ => (0.8 * distance_score, distance / 300.0),
                };

                let capacity_score = match self.registry.get_status(&location.id) {
                    Some(status) => {
                        let avg = (status.cpu_percent + status.memory_percent) / 2.0;
                        (1.0 - avg / 100.0).clamp(0.0, 1.0)
                    }
                    None => 1.0,
                };

                let total_score = weights.latency_weight * latency_score
                    + weights.distance_weight * distance_score
                    + weights.capacity_weight * capacity_score;

                RankedLocation {
                    location_id: location.id,
                    latency_score,
                    distance_score,
                    capacity_score,
                    total_score,
                    estimated_latency_ms,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.total_score.partial_cmp(&a.total_score).unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.location_id.cmp(&b.location_id))
        });
        ranked
    }

    pub fn get_optimal_location(&self, latitude: f64, longitude: f64) -> Option<RankedLocation> {
        self.rank_locations(latitude, longitude, &RankingWeights::default())
            .into_iter()
            .next()
    }

    pub fn get_optimal_locations(&self, latitude: f64, longitude: f64, n: usize) -> Vec<RankedLocation> {
        let mut ranked = self.rank_locations(latitude, longitude, &RankingWeights::default());
        ranked.truncate(n);
        ranked
    }

    /// A location is stale when it has no stats or its stats are older
    /// than the configured threshold.
    pub fn is_stale(&self, location_id: &str) -> bool {
        match self.get_stats(location_id).and_then(|s| s.last_updated) {
            Some(updated) => updated.elapsed() > self.config.stale_threshold,
            None => true,
        }
    }

    pub fn get_stale_locations(&self) -> Vec<String> {
        self.registry.get_enabled_locations()
            .into_iter()
            .filter(|l| self.is_stale(&l.id))
            .map(|l| l.id)
            .collect()
    }

    /// Conjunction of budget threshold checks. Absent stats fail the
    /// budget; no data is not "good".
    pub fn meets_budget(&self, location_id: &str, budget: &LatencyBudget) -> bool {
        match self.get_stats(location_id) {
            Some(stats) => {
                stats.p50_ms <= budget.max_p50_ms
                    && stats.p99_ms <= budget.max_p99_ms
                    && stats.success_rate >= budget.min_success_rate
            }
            None => false,
        }
    }
}

/// Injected latency probe; real implementations time a round trip to the
/// location's probe endpoint.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn measure(&self, location_id: &str) -> Result<Duration, ProbeError>;
}

/// Closure adapter for tests and small hosts.
pub struct FnLatencyProbe<F>(pub F);

#[async_trait]
impl<F, Fut> LatencyProbe for FnLatencyProbe<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Duration, ProbeError>> + Send + 'static,
{
    async fn measure(&self, location_id: &str) -> Result<Duration, ProbeError> {
        (self.0)(location_id.to_string()).await
    }
}

/// Background prober feeding the optimizer.
pub struct LatencyProber {
    optimizer: Arc<LatencyOptimizer>,
    probe: Arc<dyn LatencyProbe>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LatencyProber {
    pub fn new(optimizer: Arc<LatencyOptimizer>, probe: Arc<dyn LatencyProbe>) -> Self {
        Self {
            optimizer,
            probe,
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Probe one location now and record the result.
    ///
    /// A failed probe is recorded as an unsuccessful measurement carrying
    /// the probe's error; only an unknown location id is an error here.
    pub async fn probe_location(&self, location_id: &str) -> Result<LatencyMeasurement, LatencyError> {
        if self.optimizer.registry.get_location(location_id).is_none() {
            return Err(LatencyError::NotFound(location_id.to_string()));
        }
        let measurement = Self::run_probe(
            &self.probe,
            location_id,
            self.optimizer.config.probe_timeout,
        ).await;
        self.optimizer.record_measurement(measurement.clone());
        Ok(measurement)
    }

    async fn run_probe(probe: &Arc<dyn LatencyProbe>, location_id: &str, timeout: Duration) -> LatencyMeasurement {
        let outcome = tokio::time::timeout(timeout, probe.measure(location_id)).await;
        match outcome {
            Ok(Ok(latency)) => LatencyMeasurement {
                location_id: location_id.to_string(),
                latency,
                timestamp: Instant::now(),
                success: true,
                error: None,
            },
            Ok(Err(e)) => {
                debug!(location = %location_id, error = %e, "Latency probe failed");
                LatencyMeasurement {
                    location_id: location_id.to_string(),
                    latency: Duration::ZERO,
                    timestamp: Instant::now(),
                    success: false,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                warn!(location = %location_id, "Latency probe timed out");
                LatencyMeasurement {
                    location_id: location_id.to_string(),
                    latency: timeout,
                    timestamp: Instant::now(),
                    success: false,
                    error: Some("probe timed out".into()),
                }
            }
        }
    }

    /// Start the probe loop. Calling start on a running prober is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);

        let optimizer = Arc::clone(&self.optimizer);
        let probe = Arc::clone(&self.probe);

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(optimizer.config.probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_sweep(&optimizer, &probe).await;
                    }
                    _ = rx.changed() => {
                        info!("Latency prober stopping");
                        break;
                    }
                }
            }
        }));
        info!(
            interval_secs = self.optimizer.config.probe_interval.as_secs(),
            "Latency prober started"
        );
    }

    async fn run_sweep(optimizer: &Arc<LatencyOptimizer>, probe: &Arc<dyn LatencyProbe>) {
        let mut tasks: JoinSet<LatencyMeasurement> = JoinSet::new();
        for location in optimizer.registry.get_enabled_locations() {
            let probe = Arc::clone(probe);
            let timeout = optimizer.config.probe_timeout;
            tasks.spawn(async move {
                Self::run_probe(&probe, &location.id, timeout).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok(measurement) = joined {
                optimizer.record_measurement(measurement);
            }
        }
    }

    /// Stop the loop and wait for it to exit. Safe to call once.
    pub async fn stop(&self) {
        let tx = self.stop_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
