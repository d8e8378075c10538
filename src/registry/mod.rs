//! EdgeMesh Location Registry
//!
//! Registry of geographic edge locations with per-location health status,
//! haversine nearest-location search, and weighted multi-factor scoring.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid location: {0}")]
    Validation(String),
    #[error("Location not found: {0}")]
    NotFound(String),
}

/// Probe failure reported by an injected health or latency probe.
#[derive(Error, Debug, Clone)]
#[error("probe failed: {0}")]
pub struct ProbeError(pub String);

/// Geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance in kilometers using the Haversine formula.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        const R: f64 = 6371.0; // Earth radius in km

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) +
                lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        R * c
    }
}

/// A geographically distinct serving point.
///
/// Immutable after registration except for the capacity counters; owned
/// exclusively by the registry map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeLocation {
    pub id: String,
    pub name: String,
    pub region: String,
    pub country: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Total capacity in bytes.
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub max_conns: u64,
    /// Multiplicative routing weight applied to the composite score.
    pub weight: f64,
    pub enabled: bool,
}

impl EdgeLocation {
    pub fn new(id: impl Into<String>, region: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            region: region.into(),
            country: String::new(),
            city: String::new(),
            latitude,
            longitude,
            capacity_bytes: 0,
            used_bytes: 0,
            max_conns: 10_000,
            weight: 1.0,
            enabled: true,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = city.into();
        self
    }

    pub fn with_capacity(mut self, capacity_bytes: u64, max_conns: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self.max_conns = max_conns;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Mutable health snapshot for one location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeStatus {
    pub healthy: bool,
    pub latency: Duration,
    pub last_check: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
    pub bytes_served: u64,
    pub active_conns: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Default for EdgeStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            latency: Duration::ZERO,
            last_check: Utc::now(),
            request_count: 0,
            error_count: 0,
            bytes_served: 0,
            active_conns: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
        }
    }
}

/// Weights for the four normalized selection sub-scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub distance_weight: f64,
    pub latency_weight: f64,
    pub capacity_weight: f64,
    pub load_weight: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            distance_weight: 0.3,
            latency_weight: 0.4,
            capacity_weight: 0.15,
            load_weight: 0.15,
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Latency above this marks a probed location unhealthy.
    pub max_latency: Duration,
    /// Distance used to normalize the distance sub-score.
    pub max_distance_km: f64,
    pub weights: ScoringWeights,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(500),
            max_distance_km: 20_000.0,
            weights: ScoringWeights::default(),
        }
    }
}

/// Optional filters for `select_location`.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub required_region: Option<String>,
    pub required_country: Option<String>,
}

/// Registry snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_locations: usize,
    pub enabled_locations: usize,
    pub healthy_locations: usize,
}

/// Registry of edge locations and their health status.
///
/// Locations and statuses live under separate locks; everything handed to
/// callers is a copy.
pub struct EdgeRegistry {
    config: RegistryConfig,
    locations: RwLock<HashMap<String, EdgeLocation>>,
    statuses: RwLock<HashMap<String, EdgeStatus>>,
}

impl EdgeRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            locations: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a location together with a fresh status record.
    pub fn register_location(&self, location: EdgeLocation) -> Result<(), RegistryError> {
        if location.id.is_empty() {
            return Err(RegistryError::Validation("location id must not be empty".into()));
        }
        let id = location.id.clone();
        self.locations.write().insert(id.clone(), location);
        self.statuses.write().entry(id.clone()).or_default();
        info!(location = %id, "Registered edge location");
        Ok(())
    }

    /// Remove a location and its status record.
    pub fn unregister_location(&self, id: &str) -> Result<EdgeLocation, RegistryError> {
        let removed = self.locations.write().remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.statuses.write().remove(id);
        info!(location = %id, "Unregistered edge location");
        Ok(removed)
    }

    pub fn get_location(&self, id: &str) -> Option<EdgeLocation> {
        self.locations.read().get(id).cloned()
    }

    pub fn get_status(&self, id: &str) -> Option<EdgeStatus> {
        self.statuses.read().get(id).cloned()
    }

    pub fn get_locations(&self) -> Vec<EdgeLocation> {
        self.locations.read().values().cloned().collect()
    }

    pub fn get_enabled_locations(&self) -> Vec<EdgeLocation> {
        self.locations.read().values().filter(|l| l.enabled).cloned().collect()
    }

    /// Enabled locations whose status is currently healthy.
    ///
    /// Lock order is locations before statuses throughout the registry.
    pub fn get_healthy_locations(&self) -> Vec<EdgeLocation> {
        let locations = self.locations.read();
        let statuses = self.statuses.read();
        locations.values()
            .filter(|l| l.enabled)
            .filter(|l| statuses.get(&l.id).map(|s| s.healthy).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn get_locations_by_region(&self, region: &str) -> Vec<EdgeLocation> {
        self.locations.read().values()
            .filter(|l| l.region == region)
            .cloned()
            .collect()
    }

    pub fn get_locations_by_country(&self, country: &str) -> Vec<EdgeLocation> {
        self.locations.read().values()
            .filter(|l| l.country == country)
            .cloned()
            .collect()
    }

    pub fn set_location_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut locations = self.locations.write();
        let location = locations.get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        location.enabled = enabled;
        Ok(())
    }

    /// Write a health-check result for a location.
    pub fn set_location_health(&self, id: &str, healthy: bool, latency: Duration) -> Result<(), RegistryError> {
        let mut statuses = self.statuses.write();
        let status = statuses.get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        status.healthy = healthy;
        status.latency = latency;
        status.last_check = Utc::now();
        debug!(location = %id, healthy, latency_ms = latency.as_millis() as u64, "Updated location health");
        Ok(())
    }

    /// Request-path counter update.
    pub fn record_request(&self, id: &str, bytes: u64, success: bool) {
        if let Some(status) = self.statuses.write().get_mut(id) {
            status.request_count += 1;
            status.bytes_served += bytes;
            if !success {
                status.error_count += 1;
            }
        }
    }

    pub fn set_utilization(&self, id: &str, cpu_percent: f64, memory_percent: f64) -> Result<(), RegistryError> {
        let mut statuses = self.statuses.write();
        let status = statuses.get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        status.cpu_percent = cpu_percent;
        status.memory_percent = memory_percent;
        Ok(())
    }

    pub fn connection_opened(&self, id: &str) {
        if let Some(status) = self.statuses.write().get_mut(id) {
            status.active_conns += 1;
        }
    }

    pub fn connection_closed(&self, id: &str) {
        if let Some(status) = self.statuses.write().get_mut(id) {
            status.active_conns = status.active_conns.saturating_sub(1);
        }
    }

    pub fn set_used_bytes(&self, id: &str, used_bytes: u64) -> Result<(), RegistryError> {
        let mut locations = self.locations.write();
        let location = locations.get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        location.used_bytes = used_bytes;
        Ok(())
    }

    /// Nearest enabled, healthy location to a point.
    ///
    /// `None` is a valid no-capacity outcome, not an error.
    pub fn find_nearest_location(&self, latitude: f64, longitude: f64) -> Option<EdgeLocation> {
        self.find_nearest_locations(latitude, longitude, 1).into_iter().next()
    }

    /// The `n` nearest enabled, healthy locations, sorted by distance.
    pub fn find_nearest_locations(&self, latitude: f64, longitude: f64, n: usize) -> Vec<EdgeLocation> {
        let from = GeoPoint::new(latitude, longitude);
        let mut candidates: Vec<(f64, EdgeLocation)> = self.get_healthy_locations()
            .into_iter()
            .map(|l| (from.distance_to(&l.point()), l))
            .collect();

        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        candidates.into_iter().take(n).map(|(_, l)| l).collect()
    }

    /// Best location by the four-factor weighted score.
    ///
    /// Filters by the optional region/country requirements and by health,
    /// then scores distance, observed latency, remaining capacity, and
    /// connection load, each normalized to [0,1]. The composite is scaled
    /// by the location's static weight. Ties break on lowest id.
    pub fn select_location(&self, latitude: f64, longitude: f64, opts: &SelectOptions) -> Option<EdgeLocation> {
        let from = GeoPoint::new(latitude, longitude);
        let locations = self.locations.read();
        let statuses = self.statuses.read();
        let w = &self.config.weights;

        let mut best: Option<(f64, EdgeLocation)> = None;

        for location in locations.values() {
            if !location.enabled {
                continue;
            }
            if let Some(region) = &opts.required_region {
                if &location.region != region {
                    continue;
                }
            }
            if let Some(country) = &opts.required_country {
                if &location.country != country {
                    continue;
                }
            }
            let status = match statuses.get(&location.id) {
                Some(s) if s.healthy => s,
                _ => continue,
            };

            let distance = from.distance_to(&location.point());
            let distance_score = 1.0 - (distance / self.config.max_distance_km).min(1.0);

            let max_latency_ms = self.config.max_latency.as_secs_f64() * 1000.0;
            let latency_ms = status.latency.as_secs_f64() * 1000.0;
            let latency_score = (1.0 - latency_ms / max_latency_ms).max(0.0);

            let capacity_score = if location.capacity_bytes > 0 {
                (location.capacity_bytes.saturating_sub(location.used_bytes)) as f64
                    / location.capacity_bytes as f64
            } else {
                1.0
            };

            let load_score = if location.max_conns > 0 {
                (1.0 - status.active_conns as f64 / location.max_conns as f64).max(0.0)
            } else {
                0.0
            };

            let composite = w.distance_weight * distance_score
                + w.latency_weight * latency_score
                + w.capacity_weight * capacity_score
                + w.load_weight * load_score;
            let score = composite * location.weight;

            let better = match &best {
                None => true,
                Some((best_score, best_loc)) => {
                    score > *best_score
                        || (score == *best_score && location.id < best_loc.id)
                }
            };
            if better {
                best = Some((score, location.clone()));
            }
        }

        best.map(|(_, l)| l)
    }

    pub fn stats(&self) -> RegistryStats {
        let locations = self.locations.read();
        let statuses = self.statuses.read();
        let enabled = locations.values().filter(|l| l.enabled).count();
        let healthy = locations.values()
            .filter(|l| l.enabled)
            .filter(|l| statuses.get(&l.id).map(|s| s.healthy).unwrap_or(false))
            .count();
        RegistryStats {
            total_locations: locations.len(),
            enabled_locations: enabled,
            healthy_locations: healthy,
        }
    }
}

/// Injected health probe; real implementations issue HTTP/TCP probes.
#[async_trait]
pub trait EdgeProbe: Send + Sync {
    async fn probe(&self, location: &EdgeLocation) -> Result<Duration, ProbeError>;
}

/// Closure adapter so tests and small hosts can pass a plain function.
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F, Fut> EdgeProbe for FnProbe<F>
where
    F: Fn(EdgeLocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Duration, ProbeError>> + Send + 'static,
{
    async fn probe(&self, location: &EdgeLocation) -> Result<Duration, ProbeError> {
        (self.0)(location.clone()).await
    }
}

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Background health-check driver.
///
/// Each sweep fans out one probe per enabled location; a location is
/// healthy iff its probe succeeds and the latency stays under the
/// registry's `max_latency`.
pub struct HealthMonitor {
    registry: Arc<EdgeRegistry>,
    probe: Arc<dyn EdgeProbe>,
    config: HealthMonitorConfig,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<EdgeRegistry>, probe: Arc<dyn EdgeProbe>, config: HealthMonitorConfig) -> Self {
        Self {
            registry,
            probe,
            config,
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the check loop. Calling start on a running monitor is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);

        let registry = Arc::clone(&self.registry);
        let probe = Arc::clone(&self.probe);
        let config = self.config.clone();

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_sweep(&registry, &probe, &config).await;
                    }
                    _ = rx.changed() => {
                        info!("Health monitor stopping");
                        break;
                    }
                }
            }
        }));
        info!(interval_secs = self.config.interval.as_secs(), "Health monitor started");
    }

    async fn run_sweep(registry: &Arc<EdgeRegistry>, probe: &Arc<dyn EdgeProbe>, config: &HealthMonitorConfig) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let max_latency = registry.config().max_latency;

        for location in registry.get_enabled_locations() {
            let registry = Arc::clone(registry);
            let probe = Arc::clone(probe);
            let timeout = config.probe_timeout;
            tasks.spawn(async move {
                let id = location.id.clone();
                let outcome = tokio::time::timeout(timeout, probe.probe(&location)).await;
                let (healthy, latency) = match outcome {
                    Ok(Ok(latency)) => (latency < max_latency, latency),
                    Ok(Err(e)) => {
                        warn!(location = %id, error = %e, "Health probe failed");
                        (false, Duration::ZERO)
                    }
                    Err(_) => {
                        warn!(location = %id, "Health probe timed out");
                        (false, timeout)
                    }
                };
                let _ = registry.set_location_health(&id, healthy, latency);
            });
        }

        // A stuck probe only delays its own task; siblings are joined here.
        while tasks.join_next().await.is_some() {}
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

    /// Run a single sweep immediately, outside the ticker.
    pub async fn sweep_once(&self) {
        Self::run_sweep(&self.registry, &self.probe, &self.config).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_location(id: &str, region: &str, lat: f64, lon: f64) -> EdgeLocation {
        EdgeLocation::new(id, region, lat, lon)
            .with_country("US")
            .with_capacity(1_000_000, 100)
    }

    #[test]
    fn test_haversine_identity_and_symmetry() {
        let nyc = GeoPoint::new(40.7128, -74.0060);
        let la = GeoPoint::new(34.0522, -118.2437);

        assert_eq!(nyc.distance_to(&nyc), 0.0);
        assert!((nyc.distance_to(&la) - la.distance_to(&nyc)).abs() < 1e-9);
        // NYC to LA is ~3940 km
        let distance = nyc.distance_to(&la);
        assert!(distance > 3900.0 && distance < 4000.0);
    }

    #[test]
    fn test_register_requires_id() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        let result = registry.register_location(EdgeLocation::new("", "us-east", 0.0, 0.0));
        assert!(matches!(result, Err(RegistryError::Validation(_))));
    }

    #[test]
    fn test_unregister_removes_status() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();
        assert!(registry.get_status("nyc").is_some());

        registry.unregister_location("nyc").unwrap();
        assert!(registry.get_location("nyc").is_none());
        assert!(registry.get_status("nyc").is_none());

        assert!(matches!(registry.unregister_location("nyc"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_nearest_location_scenario() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();
        registry.register_location(test_location("london", "eu-west", 51.51, -0.13)).unwrap();

        let near_nyc = registry.find_nearest_location(40.7, -74.0).unwrap();
        assert_eq!(near_nyc.id, "nyc");

        let near_london = registry.find_nearest_location(51.5, -0.1).unwrap();
        assert_eq!(near_london.id, "london");
    }

    #[test]
    fn test_nearest_is_minimal() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();
        registry.register_location(test_location("london", "eu-west", 51.51, -0.13)).unwrap();
        registry.register_location(test_location("sfo", "us-west", 37.77, -122.42)).unwrap();

        let from = GeoPoint::new(48.85, 2.35); // Paris
        let nearest = registry.find_nearest_location(from.latitude, from.longitude).unwrap();
        let nearest_dist = from.distance_to(&nearest.point());
        for other in registry.get_healthy_locations() {
            assert!(nearest_dist <= from.distance_to(&other.point()));
        }
    }

    #[test]
    fn test_nearest_skips_unhealthy_and_disabled() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();
        registry.register_location(test_location("sfo", "us-west", 37.77, -122.42)).unwrap();

        registry.set_location_health("nyc", false, Duration::from_millis(900)).unwrap();
        let nearest = registry.find_nearest_location(40.7, -74.0).unwrap();
        assert_eq!(nearest.id, "sfo");

        registry.set_location_enabled("sfo", false).unwrap();
        assert!(registry.find_nearest_location(40.7, -74.0).is_none());
    }

    #[test]
    fn test_find_nearest_locations_sorted() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();
        registry.register_location(test_location("london", "eu-west", 51.51, -0.13)).unwrap();
        registry.register_location(test_location("sfo", "us-west", 37.77, -122.42)).unwrap();

        let ranked = registry.find_nearest_locations(40.7, -74.0, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "nyc");
        assert_eq!(ranked[1].id, "sfo");
    }

    #[test]
    fn test_select_location_filters_region() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();
        registry.register_location(test_location("london", "eu-west", 51.51, -0.13)).unwrap();

        let opts = SelectOptions { required_region: Some("eu-west".into()), ..Default::default() };
        // Region requirement overrides raw proximity.
        let selected = registry.select_location(40.7, -74.0, &opts).unwrap();
        assert_eq!(selected.id, "london");
    }

    #[test]
    fn test_select_location_prefers_low_latency() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        // Same coordinates so distance cannot dominate.
        registry.register_location(test_location("fast", "us-east", 40.0, -74.0)).unwrap();
        registry.register_location(test_location("slow", "us-east", 40.0, -74.0)).unwrap();

        registry.set_location_health("fast", true, Duration::from_millis(10)).unwrap();
        registry.set_location_health("slow", true, Duration::from_millis(400)).unwrap();

        let selected = registry.select_location(40.0, -74.0, &SelectOptions::default()).unwrap();
        assert_eq!(selected.id, "fast");
    }

    #[test]
    fn test_select_location_weight_scales() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("plain", "us-east", 40.0, -74.0)).unwrap();
        registry.register_location(
            test_location("boosted", "us-east", 40.0, -74.0).with_weight(2.0),
        ).unwrap();

        let selected = registry.select_location(40.0, -74.0, &SelectOptions::default()).unwrap();
        assert_eq!(selected.id, "boosted");
    }

    #[test]
    fn test_request_counters() {
        let registry = EdgeRegistry::new(RegistryConfig::default());
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();

        registry.record_request("nyc", 1024, true);
        registry.record_request("nyc", 2048, false);
        registry.connection_opened("nyc");

        let status = registry.get_status("nyc").unwrap();
        assert_eq!(status.request_count, 2);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.bytes_served, 3072);
        assert_eq!(status.active_conns, 1);

        registry.connection_closed("nyc");
        registry.connection_closed("nyc"); // does not underflow
        assert_eq!(registry.get_status("nyc").unwrap().active_conns, 0);
    }

    #[tokio::test]
    async fn test_health_monitor_sweep() {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        registry.register_location(test_location("ok", "us-east", 40.0, -74.0)).unwrap();
        registry.register_location(test_location("slow", "us-east", 41.0, -74.0)).unwrap();
        registry.register_location(test_location("down", "us-east", 42.0, -74.0)).unwrap();

        let probe = Arc::new(FnProbe(|location: EdgeLocation| async move {
            match location.id.as_str() {
                "ok" => Ok(Duration::from_millis(20)),
                "slow" => Ok(Duration::from_millis(900)), // above max_latency
                _ => Err(ProbeError("connection refused".into())),
            }
        }));

        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            probe,
            HealthMonitorConfig::default(),
        );
        monitor.sweep_once().await;

        assert!(registry.get_status("ok").unwrap().healthy);
        assert!(!registry.get_status("slow").unwrap().healthy);
        assert!(!registry.get_status("down").unwrap().healthy);
    }

    #[tokio::test]
    async fn test_health_monitor_start_stop() {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        registry.register_location(test_location("nyc", "us-east", 40.71, -74.00)).unwrap();

        let probe = Arc::new(FnProbe(|_: EdgeLocation| async move {
            Ok::<_, ProbeError>(Duration::from_millis(5))
        }));
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            probe,
            HealthMonitorConfig {
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(100),
            },
        );

        monitor.start();
        monitor.start(); // idempotent
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        assert!(registry.get_status("nyc").unwrap().healthy);
    }
}
