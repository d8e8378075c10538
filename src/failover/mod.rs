//! EdgeMesh Failover Manager
//!
//! Per-region health trend tracking and the automatic two-way failover
//! state machine: sustained degradation redirects a source region to a
//! target region, sustained recovery reverses it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::EdgeRegistry;

#[derive(Error, Debug)]
pub enum FailoverError {
    #[error("Invalid policy: {0}")]
    Validation(String),
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),
    #[error("Event not found: {0}")]
    EventNotFound(String),
    #[error("No eligible target region for policy {0}")]
    NoEligibleTarget(String),
}

/// Global failover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    Normal,
    Detecting,
    Failover,
    Recovery,
}

/// Operator-authored failover policy for one source region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub id: String,
    pub source_region: String,
    /// Target regions in preference order.
    pub target_regions: Vec<String>,
    pub auto_failover: bool,
    pub auto_recovery: bool,
    /// Health-score floor reported to dashboards; trend thresholds live in
    /// the manager config.
    pub health_threshold: f64,
}

/// Rolling per-region health trend.
#[derive(Debug, Clone, Serialize)]
pub struct RegionHealth {
    pub region: String,
    pub healthy: bool,
    pub consecutive_fails: u32,
    pub consecutive_ok: u32,
    pub last_updated: DateTime<Utc>,
}

/// A live redirection record.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveFailover {
    pub policy_id: String,
    pub source_region: String,
    pub target_region: String,
    pub state: FailoverState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverEventType {
    FailoverStarted,
    FailoverCompleted,
    RecoveryStarted,
    RecoveryCompleted,
}

/// Append-only audit record of one state transition.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub event_type: FailoverEventType,
    pub source_region: String,
    pub target_region: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Manager configuration
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Consecutive failed health reports before auto-failover fires.
    pub consecutive_fails_threshold: u32,
    /// Consecutive healthy reports before auto-recovery fires.
    pub consecutive_ok_threshold: u32,
    /// Event log cap; oldest entries drop first.
    pub max_events: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            consecutive_fails_threshold: 3,
            consecutive_ok_threshold: 5,
            max_events: 1000,
        }
    }
}

/// Delegated traffic switch, e.g. DNS weight updates or anycast
/// withdrawal. The manager commits its own state regardless of what the
/// implementation does, and makes no guarantee that data has been
/// replicated to the target before traffic moves.
#[async_trait]
pub trait TrafficSwitch: Send + Sync {
    async fn redirect(&self, source_region: &str, target_region: &str);
    async fn restore(&self, source_region: &str, target_region: &str);
}

/// Default switch that only logs.
pub struct NoopTrafficSwitch;

#[async_trait]
impl TrafficSwitch for NoopTrafficSwitch {
    async fn redirect(&self, source_region: &str, target_region: &str) {
        info!(source = %source_region, target = %target_region, "Traffic redirected");
    }

    async fn restore(&self, source_region: &str, target_region: &str) {
        info!(source = %source_region, target = %target_region, "Traffic restored");
    }
}

/// Manager snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverStats {
    pub state: FailoverState,
    pub policies: usize,
    pub tracked_regions: usize,
    pub active_failovers: usize,
    pub unacknowledged_events: usize,
}

struct FailoverInner {
    state: FailoverState,
    policies: HashMap<String, FailoverPolicy>,
    region_health: HashMap<String, RegionHealth>,
    /// Keyed by policy id.
    active: HashMap<String, ActiveFailover>,
}

/// Failover manager.
///
/// Policies, health trend, and active failovers share one lock; the lock
/// is released across the delegated traffic switch and re-acquired only
/// to commit final state.
pub struct FailoverManager {
    config: FailoverConfig,
    registry: Arc<EdgeRegistry>,
    switch: Arc<dyn TrafficSwitch>,
    inner: RwLock<FailoverInner>,
    events: Mutex<Vec<FailoverEvent>>,
}

impl FailoverManager {
    pub fn new(config: FailoverConfig, registry: Arc<EdgeRegistry>, switch: Arc<dyn TrafficSwitch>) -> Self {
        Self {
            config,
            registry,
            switch,
            inner: RwLock::new(FailoverInner {
                state: FailoverState::Normal,
                policies: HashMap::new(),
                region_health: HashMap::new(),
                active: HashMap::new(),
            }),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn add_policy(&self, policy: FailoverPolicy) -> Result<(), FailoverError> {
        if policy.id.is_empty() {
            return Err(FailoverError::Validation("policy id must not be empty".into()));
        }
        if policy.source_region.is_empty() {
            return Err(FailoverError::Validation("source region must not be empty".into()));
        }
        if policy.target_regions.is_empty() {
            return Err(FailoverError::Validation("target regions must not be empty".into()));
        }
        info!(policy = %policy.id, source = %policy.source_region, "Added failover policy");
        self.inner.write().policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    pub fn remove_policy(&self, policy_id: &str) -> Result<FailoverPolicy, FailoverError> {
        self.inner.write().policies.remove(policy_id)
            .ok_or_else(|| FailoverError::PolicyNotFound(policy_id.to_string()))
    }

    pub fn get_policies(&self) -> Vec<FailoverPolicy> {
        self.inner.read().policies.values().cloned().collect()
    }

    pub fn get_region_health(&self, region: &str) -> Option<RegionHealth> {
        self.inner.read().region_health.get(region).cloned()
    }

    pub fn get_active_failovers(&self) -> Vec<ActiveFailover> {
        self.inner.read().active.values().cloned().collect()
    }

    pub fn state(&self) -> FailoverState {
        self.inner.read().state
    }

    /// Where traffic for a source region should actually go right now.
    ///
    /// Returns the active failover's target for the region, else the
    /// region itself unchanged. This is the single read path other
    /// components poll.
    pub fn current_target(&self, source_region: &str) -> String {
        let inner = self.inner.read();
        let mut redirect: Option<&ActiveFailover> = None;
        for active in inner.active.values() {
            if active.source_region != source_region {
                continue;
            }
            let earlier = match redirect {
                None => true,
                Some(existing) => active.policy_id < existing.policy_id,
            };
            if earlier {
                redirect = Some(active);
            }
        }
        redirect.map(|a| a.target_region.clone())
            .unwrap_or_else(|| source_region.to_string())
    }

    /// Feed one health observation for a region.
    ///
    /// Consecutive counters move relative to the previous record: a sign
    /// change resets the opposite counter, the first report for a region
    /// starts its counter at 1. Crossing the fail threshold initiates
    /// failover for matching auto policies; crossing the ok threshold
    /// recovers matching active failovers.
    pub async fn update_region_health(&self, region: &str, healthy: bool) {
        let mut to_failover: Vec<(String, String, String)> = Vec::new();
        let mut to_recover: Vec<String> = Vec::new();

        {
            let mut inner = self.inner.write();
            let entry = inner.region_health
                .entry(region.to_string())
                .or_insert_with(|| RegionHealth {
                    region: region.to_string(),
                    healthy,
                    consecutive_fails: 0,
                    consecutive_ok: 0,
                    last_updated: Utc::now(),
                });
            if healthy {
                entry.consecutive_ok += 1;
                entry.consecutive_fails = 0;
            } else {
                entry.consecutive_fails += 1;
                entry.consecutive_ok = 0;
            }
            entry.healthy = healthy;
            entry.last_updated = Utc::now();
            let fails = entry.consecutive_fails;
            let oks = entry.consecutive_ok;

            if !healthy && fails >= self.config.consecutive_fails_threshold {
                let mut policies: Vec<&FailoverPolicy> = inner.policies.values()
                    .filter(|p| p.source_region == region && p.auto_failover)
                    .filter(|p| !inner.active.contains_key(&p.id))
                    .collect();
                policies.sort_by(|a, b| a.id.cmp(&b.id));
                for policy in policies {
                    match Self::pick_target(policy, &inner.region_health, &self.registry) {
                        Some(target) => to_failover.push((
                            policy.id.clone(),
                            policy.source_region.clone(),
                            target,
                        )),
                        None => warn!(policy = %policy.id, "No eligible target region"),
                    }
                }
            } else if !healthy
                && inner.state == FailoverState::Normal
                && inner.policies.values().any(|p| p.source_region == region && p.auto_failover)
            {
                inner.state = FailoverState::Detecting;
                debug!(region = %region, fails, "Region degradation detected");
            }

            if healthy && oks >= self.config.consecutive_ok_threshold {
                let mut recoverable: Vec<String> = inner.active.values()
                    .filter(|a| a.source_region == region)
                    .filter(|a| {
                        inner.policies.get(&a.policy_id)
                            .map(|p| p.auto_recovery)
                            .unwrap_or(false)
                    })
                    .map(|a| a.policy_id.clone())
                    .collect();
                recoverable.sort();
                to_recover = recoverable;
            }
        }

        for (policy_id, source, target) in to_failover {
            self.initiate_failover(&policy_id, &source, &target).await;
        }
        for policy_id in to_recover {
            self.initiate_recovery(&policy_id).await;
        }
    }

    /// First target region in policy order that is not known-degraded and
    /// has at least one enabled registry location. First-match, not
    /// least-loaded.
    fn pick_target(
        policy: &FailoverPolicy,
        region_health: &HashMap<String, RegionHealth>,
        registry: &Arc<EdgeRegistry>,
    ) -> Option<String> {
        policy.target_regions.iter()
            .find(|target| {
                let trusted = region_health.get(*target)
                    .map(|h| h.healthy)
                    .unwrap_or(true);
                trusted
                    && registry.get_locations_by_region(target)
                        .iter()
                        .any(|l| l.enabled)
            })
            .cloned()
    }

    /// Manually trigger the failover for a policy.
    pub async fn trigger_failover(&self, policy_id: &str) -> Result<(), FailoverError> {
        let (source, target) = {
            let inner = self.inner.read();
            let policy = inner.policies.get(policy_id)
                .ok_or_else(|| FailoverError::PolicyNotFound(policy_id.to_string()))?;
            let target = Self::pick_target(policy, &inner.region_health, &self.registry)
                .ok_or_else(|| FailoverError::NoEligibleTarget(policy_id.to_string()))?;
            (policy.source_region.clone(), target)
        };
        self.initiate_failover(policy_id, &source, &target).await;
        Ok(())
    }

    /// Manually recover the failover for a policy.
    pub async fn trigger_recovery(&self, policy_id: &str) -> Result<(), FailoverError> {
        if !self.inner.read().active.contains_key(policy_id) {
            return Err(FailoverError::PolicyNotFound(policy_id.to_string()));
        }
        self.initiate_recovery(policy_id).await;
        Ok(())
    }

    /// Idempotent failover transition: started event, state flip, the
    /// delegated switch with the lock released, completed event.
    async fn initiate_failover(&self, policy_id: &str, source: &str, target: &str) {
        {
            let mut inner = self.inner.write();
            if inner.active.contains_key(policy_id) {
                return;
            }
            inner.active.insert(policy_id.to_string(), ActiveFailover {
                policy_id: policy_id.to_string(),
                source_region: source.to_string(),
                target_region: target.to_string(),
                state: FailoverState::Failover,
                started_at: Utc::now(),
            });
            inner.state = FailoverState::Failover;
        }
        self.record_event(FailoverEventType::FailoverStarted, source, target);
        warn!(source = %source, target = %target, policy = %policy_id, "Failover started");

        // The switch may be slow; health updates must not block on it.
        self.switch.redirect(source, target).await;

        self.record_event(FailoverEventType::FailoverCompleted, source, target);
        info!(source = %source, target = %target, policy = %policy_id, "Failover completed");
    }

    /// Idempotent recovery transition; global state returns to Normal only
    /// once no other failovers remain active.
    async fn initiate_recovery(&self, policy_id: &str) {
        let (source, target) = {
            let mut inner = self.inner.write();
            let active = match inner.active.get_mut(policy_id) {
                Some(a) if a.state != FailoverState::Recovery => a,
                _ => return,
            };
            active.state = FailoverState::Recovery;
            let pair = (active.source_region.clone(), active.target_region.clone());
            inner.state = FailoverState::Recovery;
            pair
        };
        self.record_event(FailoverEventType::RecoveryStarted, &source, &target);
        info!(source = %source, target = %target, policy = %policy_id, "Recovery started");

        self.switch.restore(&source, &target).await;

        {
            let mut inner = self.inner.write();
            inner.active.remove(policy_id);
            inner.state = if inner.active.is_empty() {
                FailoverState::Normal
            } else {
                FailoverState::Failover
            };
        }
        self.record_event(FailoverEventType::RecoveryCompleted, &source, &target);
        info!(source = %source, target = %target, policy = %policy_id, "Recovery completed");
    }

    fn record_event(&self, event_type: FailoverEventType, source: &str, target: &str) {
        let mut events = self.events.lock();
        events.push(FailoverEvent {
            id: Uuid::now_v7(),
            event_type,
            source_region: source.to_string(),
            target_region: target.to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
        });
        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
    }

    pub fn get_events(&self) -> Vec<FailoverEvent> {
        self.events.lock().clone()
    }

    /// Mark an event as seen; type and timestamp are untouched.
    pub fn acknowledge_event(&self, event_id: Uuid) -> Result<(), FailoverError> {
        let mut events = self.events.lock();
        let event = events.iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| FailoverError::EventNotFound(event_id.to_string()))?;
        event.acknowledged = true;
        Ok(())
    }

    pub fn stats(&self) -> FailoverStats {
        let inner = self.inner.read();
        FailoverStats {
            state: inner.state,
            policies: inner.policies.len(),
            tracked_regions: inner.region_health.len(),
            active_failovers: inner.active.len(),
            unacknowledged_events: self.events.lock().iter().filter(|e| !e.acknowledged).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EdgeLocation, RegistryConfig};

    fn setup() -> FailoverManager {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        registry.register_location(EdgeLocation::new("use1", "us-east", 39.0, -77.0)).unwrap();
        registry.register_location(EdgeLocation::new("usw1", "us-west", 37.8, -122.4)).unwrap();
        registry.register_location(EdgeLocation::new("euw1", "eu-west", 53.3, -6.3)).unwrap();

        let manager = FailoverManager::new(
            FailoverConfig::default(),
            registry,
            Arc::new(NoopTrafficSwitch),
        );
        manager.add_policy(FailoverPolicy {
            id: "us-east-dr".into(),
            source_region: "us-east".into(),
            target_regions: vec!["us-west".into(), "eu-west".into()],
            auto_failover: true,
            auto_recovery: true,
            health_threshold: 0.8,
        }).unwrap();
        manager
    }

    #[test]
    fn test_policy_validation() {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        let manager = FailoverManager::new(FailoverConfig::default(), registry, Arc::new(NoopTrafficSwitch));

        let result = manager.add_policy(FailoverPolicy {
            id: "".into(),
            source_region: "us-east".into(),
            target_regions: vec!["us-west".into()],
            auto_failover: true,
            auto_recovery: true,
            health_threshold: 0.8,
        });
        assert!(matches!(result, Err(FailoverError::Validation(_))));

        let result = manager.add_policy(FailoverPolicy {
            id: "p".into(),
            source_region: "us-east".into(),
            target_regions: vec![],
            auto_failover: true,
            auto_recovery: true,
            health_threshold: 0.8,
        });
        assert!(matches!(result, Err(FailoverError::Validation(_))));

        assert!(matches!(manager.remove_policy("ghost"), Err(FailoverError::PolicyNotFound(_))));
    }

    #[tokio::test]
    async fn test_consecutive_counters() {
        let manager = setup();

        manager.update_region_health("us-east", false).await;
        let health = manager.get_region_health("us-east").unwrap();
        assert_eq!(health.consecutive_fails, 1);
        assert_eq!(health.consecutive_ok, 0);

        manager.update_region_health("us-east", true).await;
        let health = manager.get_region_health("us-east").unwrap();
        // Sign change resets the opposite counter.
        assert_eq!(health.consecutive_fails, 0);
        assert_eq!(health.consecutive_ok, 1);
    }

    #[tokio::test]
    async fn test_three_fails_trigger_exactly_one_failover() {
        let manager = setup();

        manager.update_region_health("us-east", false).await;
        manager.update_region_health("us-east", false).await;
        assert!(manager.get_active_failovers().is_empty());
        assert_eq!(manager.state(), FailoverState::Detecting);

        manager.update_region_health("us-east", false).await;
        let active = manager.get_active_failovers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source_region, "us-east");
        assert_eq!(active[0].target_region, "us-west");
        assert_eq!(manager.state(), FailoverState::Failover);

        // Further failures stay idempotent.
        manager.update_region_health("us-east", false).await;
        assert_eq!(manager.get_active_failovers().len(), 1);
    }

    #[tokio::test]
    async fn test_five_oks_recover_and_reset_state() {
        let manager = setup();
        for _ in 0..3 {
            manager.update_region_health("us-east", false).await;
        }
        assert_eq!(manager.get_active_failovers().len(), 1);

        for _ in 0..4 {
            manager.update_region_health("us-east", true).await;
        }
        assert_eq!(manager.get_active_failovers().len(), 1);

        manager.update_region_health("us-east", true).await;
        assert!(manager.get_active_failovers().is_empty());
        assert_eq!(manager.state(), FailoverState::Normal);
    }

    #[tokio::test]
    async fn test_current_target_passthrough_and_override() {
        let manager = setup();
        assert_eq!(manager.current_target("us-east"), "us-east");

        for _ in 0..3 {
            manager.update_region_health("us-east", false).await;
        }
        assert_eq!(manager.current_target("us-east"), "us-west");
        // Other regions are unaffected.
        assert_eq!(manager.current_target("eu-west"), "eu-west");

        for _ in 0..5 {
            manager.update_region_health("us-east", true).await;
        }
        assert_eq!(manager.current_target("us-east"), "us-east");
    }

    #[tokio::test]
    async fn test_degraded_target_is_skipped() {
        let manager = setup();

        // us-west is already known degraded; eu-west must be picked.
        manager.update_region_health("us-west", false).await;
        for _ in 0..3 {
            manager.update_region_health("us-east", false).await;
        }
        let active = manager.get_active_failovers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target_region, "eu-west");
    }

    #[tokio::test]
    async fn test_auto_failover_disabled() {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        registry.register_location(EdgeLocation::new("usw1", "us-west", 37.8, -122.4)).unwrap();
        let manager = FailoverManager::new(FailoverConfig::default(), registry, Arc::new(NoopTrafficSwitch));
        manager.add_policy(FailoverPolicy {
            id: "manual-only".into(),
            source_region: "us-east".into(),
            target_regions: vec!["us-west".into()],
            auto_failover: false,
            auto_recovery: false,
            health_threshold: 0.8,
        }).unwrap();

        for _ in 0..5 {
            manager.update_region_health("us-east", false).await;
        }
        assert!(manager.get_active_failovers().is_empty());

        // Manual trigger still works.
        manager.trigger_failover("manual-only").await.unwrap();
        assert_eq!(manager.get_active_failovers().len(), 1);
        manager.trigger_recovery("manual-only").await.unwrap();
        assert!(manager.get_active_failovers().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_recorded_and_acknowledgeable() {
        let manager = setup();
        for _ in 0..3 {
            manager.update_region_health("us-east", false).await;
        }
        for _ in 0..5 {
            manager.update_region_health("us-east", true).await;
        }

        let events = manager.get_events();
        let types: Vec<FailoverEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![
            FailoverEventType::FailoverStarted,
            FailoverEventType::FailoverCompleted,
            FailoverEventType::RecoveryStarted,
            FailoverEventType::RecoveryCompleted,
        ]);

        manager.acknowledge_event(events[0].id).unwrap();
        let events = manager.get_events();
        assert!(events[0].acknowledged);
        assert_eq!(events[0].event_type, FailoverEventType::FailoverStarted);

        assert!(matches!(
            manager.acknowledge_event(Uuid::now_v7()),
            Err(FailoverError::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_event_log_is_capped() {
        let registry = Arc::new(EdgeRegistry::new(RegistryConfig::default()));
        registry.register_location(EdgeLocation::new("usw1", "us-west", 37.8, -122.4)).unwrap();
        let manager = FailoverManager::new(
            FailoverConfig { max_events: 4, ..Default::default() },
            registry,
            Arc::new(NoopTrafficSwitch),
        );
        manager.add_policy(FailoverPolicy {
            id: "p".into(),
            source_region: "us-east".into(),
            target_regions: vec!["us-west".into()],
            auto_failover: true,
            auto_recovery: true,
            health_threshold: 0.8,
        }).unwrap();

        // Three full cycles produce 12 events; only the last 4 survive.
        for _ in 0..3 {
            for _ in 0..3 {
                manager.update_region_health("us-east", false).await;
            }
            for _ in 0..5 {
                manager.update_region_health("us-east", true).await;
            }
        }
        let events = manager.get_events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event_type, FailoverEventType::FailoverStarted);
        assert_eq!(events[3].event_type, FailoverEventType::RecoveryCompleted);
    }
}
