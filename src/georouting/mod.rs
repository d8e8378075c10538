//! EdgeMesh Geo Routing Rule Engine
//!
//! Priority-ordered routing rules evaluated against request attributes
//! (GeoIP, headers, path, tenant), with weighted traffic splits, explicit
//! rejection, and nearest-location fallback through the registry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::EdgeRegistry;

#[derive(Error, Debug)]
pub enum GeoRoutingError {
    #[error("Invalid rule: {0}")]
    Validation(String),
    #[error("Rule not found: {0}")]
    RuleNotFound(String),
    #[error("Request rejected by rule {rule_id}: {reason}")]
    Rejected { rule_id: String, reason: String },
    #[error("No location available")]
    NoLocationAvailable,
}

/// GeoIP lookup failure; counted, never fatal to routing.
#[derive(Error, Debug)]
#[error("geoip lookup failed: {0}")]
pub struct GeoIpError(pub String);

/// Result of a GeoIP lookup for a client address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoIpInfo {
    pub country: String,
    pub region: String,
    pub city: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub asn: Option<u32>,
}

/// Injected GeoIP resolver.
pub trait GeoIpLookup: Send + Sync {
    fn lookup(&self, ip: &str) -> Result<GeoIpInfo, GeoIpError>;
}

/// Request attribute a condition matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Country,
    Region,
    City,
    Asn,
    Ip,
    Cidr,
    Header,
    Path,
    Tenant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
}

/// One AND-ed term of a rule.
///
/// `header_name` names the header to match and is only meaningful for
/// `ConditionField::Header`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingCondition {
    pub field: ConditionField,
    pub op: ConditionOp,
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
}

impl RoutingCondition {
    pub fn new(field: ConditionField, op: ConditionOp, values: Vec<String>) -> Self {
        Self { field, op, values, header_name: None }
    }

    pub fn header(name: impl Into<String>, op: ConditionOp, values: Vec<String>) -> Self {
        Self {
            field: ConditionField::Header,
            op,
            values,
            header_name: Some(name.into()),
        }
    }
}

/// One weighted-split target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedTarget {
    pub location_id: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingAction {
    /// Route to a fixed location.
    Route {
        location_id: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Split traffic across locations by weight.
    Weighted { targets: Vec<WeightedTarget> },
    /// Abort routing with an error.
    Reject { reason: String },
}

/// Operator-authored routing policy, evaluated in descending priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<RoutingCondition>,
    pub action: RoutingAction,
}

/// Inbound request attributes used for routing.
#[derive(Debug, Clone, Default)]
pub struct RoutingRequest {
    pub ip: Option<String>,
    pub headers: HashMap<String, String>,
    pub path: String,
    pub tenant_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Per-request routing output.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub location_id: String,
    pub rule_id: Option<String>,
    pub geo: Option<GeoIpInfo>,
    pub reason: String,
    pub routing_time: Duration,
    pub headers: HashMap<String, String>,
}

/// Router counters; snapshot returned as a deep copy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterMetrics {
    pub total_requests: u64,
    pub geoip_lookups: u64,
    pub geoip_errors: u64,
    pub rule_matches: HashMap<String, u64>,
    pub location_routes: HashMap<String, u64>,
    pub fallback_routed: u64,
    pub rejected: u64,
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct GeoRouterConfig {
    pub geoip_enabled: bool,
    /// Last-resort location when rules and nearest search both come up empty.
    pub fallback_location: Option<String>,
    /// Seed for the weighted-split RNG; pinned in tests.
    pub rng_seed: Option<u64>,
}

impl Default for GeoRouterConfig {
    fn default() -> Self {
        Self {
            geoip_enabled: true,
            fallback_location: None,
            rng_seed: None,
        }
    }
}

/// Geo routing rule engine over the shared location registry.
///
/// Rules live under one lock, counters under another; rule evaluation
/// never holds both.
pub struct GeoRouter {
    config: GeoRouterConfig,
    registry: Arc<EdgeRegistry>,
    geoip: Option<Arc<dyn GeoIpLookup>>,
    rules: RwLock<Vec<RoutingRule>>,
    metrics: Mutex<RouterMetrics>,
    rng: Mutex<StdRng>,
}

impl GeoRouter {
    pub fn new(config: GeoRouterConfig, registry: Arc<EdgeRegistry>, geoip: Option<Arc<dyn GeoIpLookup>>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            registry,
            geoip,
            rules: RwLock::new(Vec::new()),
            metrics: Mutex::new(RouterMetrics::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Add a rule; the rule list stays sorted by priority descending.
    pub fn add_rule(&self, rule: RoutingRule) -> Result<(), GeoRoutingError> {
        if rule.id.is_empty() {
            return Err(GeoRoutingError::Validation("rule id must not be empty".into()));
        }
        let mut rules = self.rules.write();
        rules.retain(|r| r.id != rule.id);
        info!(rule = %rule.id, priority = rule.priority, "Added routing rule");
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<(), GeoRoutingError> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        if rules.len() == before {
            return Err(GeoRoutingError::RuleNotFound(rule_id.to_string()));
        }
        info!(rule = %rule_id, "Removed routing rule");
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    /// Deep copy of the current counters.
    pub fn metrics(&self) -> RouterMetrics {
        self.metrics.lock().clone()
    }

    /// Single evaluation pass: GeoIP enrichment, rules in priority order,
    /// nearest-location fallback, configured last-resort location.
    pub fn route(&self, request: &RoutingRequest) -> Result<RoutingResult, GeoRoutingError> {
        let start = Instant::now();
        self.metrics.lock().total_requests += 1;

        let geo = self.enrich(request);

        // Rule evaluation; first full match wins.
        let matched = {
            let rules = self.rules.read();
            rules.iter()
                .find(|rule| Self::matches_rule(rule, request, geo.as_ref()))
                .cloned()
        };

        let mut headers = HashMap::new();
        let mut rule_id = None;
        let mut reason = String::new();
        let mut location_id: Option<String> = None;

        if let Some(rule) = matched {
            {
                let mut metrics = self.metrics.lock();
                *metrics.rule_matches.entry(rule.id.clone()).or_insert(0) += 1;
            }
            match &rule.action {
                RoutingAction::Reject { reason } => {
                    self.metrics.lock().rejected += 1;
                    debug!(rule = %rule.id, "Request rejected by rule");
                    return Err(GeoRoutingError::Rejected {
                        rule_id: rule.id.clone(),
                        reason: reason.clone(),
                    });
                }
                RoutingAction::Route { location_id: id, headers: extra } => {
                    location_id = Some(id.clone());
                    headers = extra.clone();
                    reason = format!("rule {} routed to {}", rule.id, id);
                    rule_id = Some(rule.id.clone());
                }
                RoutingAction::Weighted { targets } => {
                    if let Some(id) = self.pick_weighted(targets) {
                        reason = format!("rule {} split to {}", rule.id, id);
                        location_id = Some(id);
                        rule_id = Some(rule.id.clone());
                    } else {
                        warn!(rule = %rule.id, "Weighted rule has no usable targets");
                    }
                }
            }
        }

        // Fallback: nearest enabled, healthy location to the caller.
        if location_id.is_none() {
            let coords = match (request.latitude, request.longitude) {
                (Some(lat), Some(lon)) => Some((lat, lon)),
                _ => geo.as_ref().and_then(|g| match (g.latitude, g.longitude) {
                    (Some(lat), Some(lon)) => Some((lat, lon)),
                    _ => None,
                }),
            };
            if let Some((lat, lon)) = coords {
                if let Some(nearest) = self.registry.find_nearest_location(lat, lon) {
                    reason = format!("nearest location {}", nearest.id);
                    location_id = Some(nearest.id);
                }
            }
        }

        // Last resort: the configured fallback location.
        if location_id.is_none() {
            if let Some(fallback) = &self.config.fallback_location {
                self.metrics.lock().fallback_routed += 1;
                reason = format!("fallback location {fallback}");
                location_id = Some(fallback.clone());
            }
        }

        let location_id = location_id.ok_or(GeoRoutingError::NoLocationAvailable)?;
        {
            let mut metrics = self.metrics.lock();
            *metrics.location_routes.entry(location_id.clone()).or_insert(0) += 1;
        }

        Ok(RoutingResult {
            location_id,
            rule_id,
            geo,
            reason,
            routing_time: start.elapsed(),
            headers,
        })
    }

    /// GeoIP enrichment; lookup failures are counted and routing proceeds
    /// without the attributes.
    fn enrich(&self, request: &RoutingRequest) -> Option<GeoIpInfo> {
        if !self.config.geoip_enabled {
            return None;
        }
        let ip = request.ip.as_deref()?;
        let geoip = self.geoip.as_ref()?;

        self.metrics.lock().geoip_lookups += 1;
        match geoip.lookup(ip) {
            Ok(info) => Some(info),
            Err(e) => {
                self.metrics.lock().geoip_errors += 1;
                debug!(ip = %ip, error = %e, "GeoIP lookup failed");
                None
            }
        }
    }

    /// A rule matches only if its condition list is non-empty and every
    /// condition matches.
    fn matches_rule(rule: &RoutingRule, request: &RoutingRequest, geo: Option<&GeoIpInfo>) -> bool {
        if rule.conditions.is_empty() {
            return false;
        }
        rule.conditions.iter().all(|c| Self::matches_condition(c, request, geo))
    }

    fn matches_condition(condition: &RoutingCondition, request: &RoutingRequest, geo: Option<&GeoIpInfo>) -> bool {
        if condition.field == ConditionField::Cidr {
            return Self::matches_cidr(condition, request.ip.as_deref());
        }

        let actual: Option<String> = match condition.field {
            ConditionField::Country => geo.map(|g| g.country.clone()),
            ConditionField::Region => geo.map(|g| g.region.clone()),
            ConditionField::City => geo.map(|g| g.city.clone()),
            ConditionField::Asn => geo.and_then(|g| g.asn).map(|a| a.to_string()),
            ConditionField::Ip => request.ip.clone(),
            ConditionField::Header => condition.header_name.as_ref()
                .and_then(|name| request.headers.get(name).cloned()),
            ConditionField::Path => Some(request.path.clone()),
            ConditionField::Tenant => request.tenant_id.clone(),
            ConditionField::Cidr => unreachable!(),
        };

        // A missing attribute never satisfies a condition.
        let actual = match actual {
            Some(v) => v,
            None => return false,
        };
        Self::apply_op(condition.op, &actual, &condition.values)
    }

    fn apply_op(op: ConditionOp, actual: &str, values: &[String]) -> bool {
        let first = values.first().map(String::as_str).unwrap_or("");
        match op {
            ConditionOp::Eq => actual == first,
            ConditionOp::Ne => actual != first,
            ConditionOp::In => values.iter().any(|v| v == actual),
            ConditionOp::NotIn => !values.iter().any(|v| v == actual),
            ConditionOp::Contains => actual.contains(first),
            ConditionOp::StartsWith => actual.starts_with(first),
            ConditionOp::EndsWith => actual.ends_with(first),
        }
    }

    /// Membership of the client IP in any of the condition's networks;
    /// negated operators invert the membership test.
    fn matches_cidr(condition: &RoutingCondition, ip: Option<&str>) -> bool {
        let ip: IpAddr = match ip.and_then(|s| s.parse().ok()) {
            Some(ip) => ip,
            None => return false,
        };
        let member = condition.values.iter()
            .filter_map(|v| v.parse::<IpNetwork>().ok())
            .any(|net| net.contains(ip));
        match condition.op {
            ConditionOp::Ne | ConditionOp::NotIn => !member,
            _ => member,
        }
    }

    fn pick_weighted(&self, targets: &[WeightedTarget]) -> Option<String> {
        let total: u64 = targets.iter().map(|t| t.weight as u64).sum();
        if total == 0 {
            return None;
        }
        let mut roll = self.rng.lock().gen_range(0..total);
        for target in targets {
            let weight = target.weight as u64;
            if roll < weight {
                return Some(target.location_id.clone());
            }
            roll -= weight;
        }
        None
    }
}
