//! EdgeMesh main binary

use std::time::Duration;

use edgemesh::{
    Backend, BalancingAlgorithm, ConditionField, ConditionOp, EdgeLocation, EdgeMesh,
    EdgeMeshConfig, FailoverPolicy, RequestContext, RoutingAction, RoutingCondition,
    RoutingRequest, RoutingRule,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting EdgeMesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = EdgeMeshConfig::default();
    config.balancer.algorithm = BalancingAlgorithm::WeightedRoundRobin;
    config.router.fallback_location = Some("us-east-1".into());

    let mesh = EdgeMesh::new(config);

    // Register edge locations
    mesh.registry.register_location(
        EdgeLocation::new("us-east-1", "us-east", 39.04, -77.49)
            .with_country("US")
            .with_city("Ashburn")
            .with_capacity(512 * 1024 * 1024 * 1024, 20_000),
    )?;
    mesh.registry.register_location(
        EdgeLocation::new("us-west-1", "us-west", 37.77, -122.42)
            .with_country("US")
            .with_city("San Francisco")
            .with_capacity(256 * 1024 * 1024 * 1024, 10_000),
    )?;
    mesh.registry.register_location(
        EdgeLocation::new("eu-west-1", "eu-west", 53.34, -6.26)
            .with_country("IE")
            .with_city("Dublin")
            .with_capacity(256 * 1024 * 1024 * 1024, 10_000),
    )?;
    mesh.registry.register_location(
        EdgeLocation::new("ap-south-1", "ap-south", 1.35, 103.82)
            .with_country("SG")
            .with_city("Singapore")
            .with_capacity(128 * 1024 * 1024 * 1024, 8_000),
    )?;
    info!("Registered 4 edge locations");

    // EU data-residency rule
    mesh.router.add_rule(RoutingRule {
        id: "eu-residency".into(),
        name: "EU data residency".into(),
        priority: 100,
        conditions: vec![RoutingCondition::new(
            ConditionField::Country,
            ConditionOp::In,
            vec!["DE".into(), "FR".into(), "IE".into(), "NL".into(), "ES".into(), "IT".into()],
        )],
        action: RoutingAction::Route {
            location_id: "eu-west-1".into(),
            headers: Default::default(),
        },
    })?;

    // Backend pool behind the east-coast location
    mesh.balancer.register_backend(
        Backend::new("edge-nyc-1", "10.0.1.10", 8443)
            .with_weight(3)
            .with_region("us-east")
            .with_location("us-east-1"),
    )?;
    mesh.balancer.register_backend(
        Backend::new("edge-nyc-2", "10.0.1.11", 8443)
            .with_weight(1)
            .with_region("us-east")
            .with_location("us-east-1"),
    )?;
    info!("Registered 2 backends");

    // Failover policy: us-east fails over to us-west, then eu-west
    mesh.failover.add_policy(FailoverPolicy {
        id: "us-east-dr".into(),
        source_region: "us-east".into(),
        target_regions: vec!["us-west".into(), "eu-west".into()],
        auto_failover: true,
        auto_recovery: true,
        health_threshold: 0.8,
    })?;

    // Route a test request from Manhattan
    let request = RoutingRequest {
        ip: Some("203.0.113.10".into()),
        path: "/v1/objects/demo".into(),
        latitude: Some(40.71),
        longitude: Some(-74.00),
        ..Default::default()
    };
    match mesh.route(&request) {
        Ok(result) => {
            info!(
                location = %result.location_id,
                reason = %result.reason,
                routing_us = result.routing_time.as_micros() as u64,
                "Routed test request"
            );
            let backend = mesh.select_backend(&RequestContext {
                client_ip: request.ip.clone(),
                latitude: request.latitude,
                longitude: request.longitude,
            })?;
            info!(backend = %backend.id, "Selected backend");
            mesh.balancer.record_request(&backend.id, true, Duration::from_millis(42))?;
        }
        Err(e) => {
            info!("Error routing request: {}", e);
        }
    }

    // Print a report snapshot
    let report = mesh.generate_report();
    info!(
        locations = report.registry.total_locations,
        healthy = report.registry.healthy_locations,
        backends = report.balancer.total_backends,
        requests = report.router.total_requests,
        failover_state = ?report.failover.state,
        "Control plane report"
    );

    info!("EdgeMesh control plane ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutting down EdgeMesh");
    Ok(())
}
