//! End-to-end provider scenarios: presence events in, HTTP and registry
//! records out, with mock endpoints and an in-memory registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;

use devfleet_agent::{
    ColdResetCoordinator, EndpointEvent, EndpointFactory, FleetWatcher, HeartbeatObserver,
    MockEndpointFactory, ProxyPortAllocator, StatusObserver,
};
use devfleet_core::{DeviceId, DeviceState, PresenceEvent};
use devfleet_gateway::{create_router, GatewayConfig, GatewayState};
use devfleet_registry::{HeartbeatClient, HeartbeatConfig, MockRegistry, ReconnectBackoff};

struct Provider {
    server: TestServer,
    fleet: Arc<FleetWatcher>,
    factory: Arc<MockEndpointFactory>,
    ports: Arc<ProxyPortAllocator>,
    registry: MockRegistry,
}

async fn provider(range: std::ops::Range<u16>, factory: MockEndpointFactory) -> Provider {
    let registry = MockRegistry::new();
    let mut config = HeartbeatConfig::new("localhost:4000", "apple", "http://10.0.0.2:3600");
    config.backoff = ReconnectBackoff::fixed(Duration::from_millis(5));
    config.ping_interval = Duration::from_millis(20);
    let heartbeat = Arc::new(
        HeartbeatClient::connect(Arc::new(registry.clone()), config)
            .await
            .unwrap(),
    );

    let factory = Arc::new(factory);
    let ports = ProxyPortAllocator::new(range, 100);
    let observer = HeartbeatObserver::new(Arc::clone(&heartbeat), "10.0.0.2", "Apple");
    let fleet = Arc::new(FleetWatcher::new(
        Arc::clone(&ports),
        Arc::clone(&factory) as Arc<dyn EndpointFactory>,
        Arc::new(observer) as Arc<dyn StatusObserver>,
    ));
    let coordinator = Arc::new(ColdResetCoordinator::new(
        Arc::clone(&fleet),
        heartbeat,
        "10.0.0.2",
        "Apple",
    ));

    let app = create_router(GatewayState::new(
        Arc::clone(&fleet),
        coordinator,
        GatewayConfig::default(),
    ));

    Provider {
        server: TestServer::new(app).unwrap(),
        fleet,
        factory,
        ports,
        registry,
    }
}

fn udid(s: &str) -> DeviceId {
    DeviceId::parse(s).unwrap()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_ready(provider: &Provider, id: &str) {
    let id = udid(id);
    wait_until("device ready", || {
        provider.fleet.get(&id).map(|l| l.state()) == Some(DeviceState::Ready)
    })
    .await;
}

fn assert_port_invariant(devices: &Value) {
    for device in devices["devices"].as_array().unwrap() {
        let ready = device["state"] == "ready";
        let has_port = device["publicPort"].as_u64().unwrap() != 0;
        assert_eq!(ready, has_port, "port/state mismatch: {device}");
    }
}

#[tokio::test]
async fn plug_reports_preparing_then_ready() {
    let provider = provider(47000..47050, MockEndpointFactory::new()).await;
    provider
        .fleet
        .handle_event(PresenceEvent::plugged("ABC123"))
        .await;

    wait_until("two registry records", || {
        provider.registry.updates_for(&udid("ABC123")).len() >= 2
    })
    .await;
    let updates = provider.registry.updates_for(&udid("ABC123"));

    assert!(updates[0].provider.is_none());
    assert_eq!(updates[0].colding, Some(false));
    let ready = &updates[1];
    let port = provider.fleet.get(&udid("ABC123")).unwrap().public_port();
    assert_eq!(
        ready.provider.as_ref().unwrap().wda_url,
        format!("http://10.0.0.2:{port}")
    );
    let properties = ready.properties.as_ref().unwrap();
    assert_eq!(properties.version.as_deref(), Some("16.0"));
    assert_eq!(properties.sdk_version.as_deref(), Some("20"));

    let response = provider.server.get("/devices").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["devices"][0]["udid"], "ABC123");
    assert_eq!(body["devices"][0]["state"], "ready");
    assert_port_invariant(&body);
}

#[tokio::test]
async fn unplug_while_preparing_never_reports_ready() {
    let factory = MockEndpointFactory::new();
    factory.hang_healthcheck_for(&udid("ABC123"));
    let provider = provider(47050..47100, factory).await;

    provider
        .fleet
        .handle_event(PresenceEvent::plugged("ABC123"))
        .await;
    wait_until("endpoint start", || {
        provider
            .factory
            .events()
            .iter()
            .any(|e| matches!(e, EndpointEvent::Started { .. }))
    })
    .await;

    provider
        .fleet
        .handle_event(PresenceEvent::unplugged("ABC123"))
        .await;

    assert!(provider.fleet.get(&udid("ABC123")).is_none());
    assert_eq!(provider.ports.outstanding(), 0);
    assert!(!provider.fleet.serializer().is_busy());
    assert!(!provider
        .factory
        .endpoint(&udid("ABC123"))
        .unwrap()
        .is_running());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let updates = provider.registry.updates_for(&udid("ABC123"));
    assert!(updates.iter().all(|u| u.provider.is_none()));
    assert!(!provider.registry.updates().is_empty());

    let body: Value = provider.server.get("/devices").await.json();
    assert!(body["devices"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn reset_unknown_device_is_bad_request() {
    let provider = provider(47100..47150, MockEndpointFactory::new()).await;
    provider
        .fleet
        .handle_event(PresenceEvent::plugged("ABC123"))
        .await;
    wait_ready(&provider, "ABC123").await;
    let before = provider.fleet.get(&udid("ABC123")).unwrap().snapshot();

    let response = provider
        .server
        .post("/cold")
        .add_query_param("udid", "ZZZ999")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["description"], "udid: ZZZ999 not found");

    let response = provider
        .server
        .post("/devices/ZZZ999/cold")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let after = provider.fleet.get(&udid("ABC123")).unwrap().snapshot();
    assert_eq!(before, after);
}

#[tokio::test]
async fn reset_without_udid_is_bad_request() {
    let provider = provider(47150..47200, MockEndpointFactory::new()).await;

    let response = provider.server.post("/cold").expect_failure().await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["description"], "udid is required");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_plugs_prepare_one_at_a_time() {
    let provider = provider(
        47200..47250,
        MockEndpointFactory::with_delay(Duration::from_millis(30)),
    )
    .await;

    provider.fleet.handle_event(PresenceEvent::plugged("A")).await;
    provider.fleet.handle_event(PresenceEvent::plugged("B")).await;
    wait_ready(&provider, "A").await;
    wait_ready(&provider, "B").await;

    let mut open: Option<DeviceId> = None;
    for event in provider.factory.events() {
        match event {
            EndpointEvent::Started { udid, .. } => {
                assert!(open.is_none(), "{udid} started while {open:?} was preparing");
                open = Some(udid);
            }
            EndpointEvent::Checked { udid, healthy } => {
                assert!(healthy);
                assert_eq!(open.take(), Some(udid));
            }
            EndpointEvent::Stopped { udid } => panic!("{udid} stopped unexpectedly"),
        }
    }
    assert!(open.is_none());

    let a = provider.fleet.get(&udid("A")).unwrap().public_port();
    let b = provider.fleet.get(&udid("B")).unwrap().public_port();
    assert_ne!(a, b);
}

#[tokio::test]
async fn repeated_cold_resets_move_port_and_succeed() {
    let provider = provider(47250..47300, MockEndpointFactory::new()).await;
    provider
        .fleet
        .handle_event(PresenceEvent::plugged("ABC123"))
        .await;
    wait_ready(&provider, "ABC123").await;
    let initial = provider.fleet.get(&udid("ABC123")).unwrap().public_port();

    let mut ports = vec![initial];
    for _ in 0..2 {
        let response = provider.server.post("/devices/ABC123/cold").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        ports.push(provider.fleet.get(&udid("ABC123")).unwrap().public_port());
    }

    assert_ne!(ports[1], ports[2]);
    assert_ne!(ports[0], ports[1]);
    let lifecycle = provider.fleet.get(&udid("ABC123")).unwrap();
    assert_eq!(lifecycle.state(), DeviceState::Ready);
    assert!(!lifecycle.is_colding());
    assert_eq!(provider.ports.outstanding(), 1);

    let expected = format!("http://10.0.0.2:{}", ports[2]);
    wait_until("new endpoint announced", || {
        provider
            .registry
            .updates_for(&udid("ABC123"))
            .last()
            .and_then(|u| u.provider.clone())
            .is_some_and(|p| p.wda_url == expected)
    })
    .await;
}

#[tokio::test]
async fn failed_reset_reports_failure_with_ok_status() {
    let provider = provider(47300..47350, MockEndpointFactory::new()).await;
    provider
        .fleet
        .handle_event(PresenceEvent::plugged("FLAKY1"))
        .await;
    wait_ready(&provider, "FLAKY1").await;
    provider
        .factory
        .endpoint(&udid("FLAKY1"))
        .unwrap()
        .set_fail_healthcheck(true);

    let response = provider
        .server
        .post("/cold")
        .add_query_param("udid", "FLAKY1")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert!(body["description"]
        .as_str()
        .unwrap()
        .contains("healthcheck failed"));

    let body: Value = provider.server.get("/devices/FLAKY1").await.json();
    assert_eq!(body["state"], "fatal");
    assert_eq!(body["publicPort"], 0);
}

#[tokio::test]
async fn reset_while_preparing_conflicts() {
    let factory = MockEndpointFactory::new();
    factory.hang_healthcheck_for(&udid("SLOW01"));
    let provider = provider(47350..47400, factory).await;
    provider
        .fleet
        .handle_event(PresenceEvent::plugged("SLOW01"))
        .await;

    let response = provider
        .server
        .post("/devices/SLOW01/cold")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    provider.fleet.shutdown().await;
}

#[tokio::test]
async fn reconnect_reannounces_each_device_once() {
    let provider = provider(47400..47450, MockEndpointFactory::new()).await;
    for id in ["AAA111", "BBB222"] {
        provider.fleet.handle_event(PresenceEvent::plugged(id)).await;
        wait_ready(&provider, id).await;
    }
    wait_until("ready records delivered", || {
        provider.registry.updates_in_session(1).len() >= 4
    })
    .await;

    provider.registry.drop_connection();
    wait_until("second session", || provider.registry.session_count() >= 2).await;
    wait_until("re-announcement", || {
        provider.registry.updates_in_session(2).len() >= 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resent = provider.registry.updates_in_session(2);
    let ids: Vec<_> = resent.iter().map(|u| u.udid.clone()).collect();
    let unique: HashSet<_> = ids.iter().cloned().collect();
    assert_eq!(ids.len(), 2, "re-announced: {ids:?}");
    assert_eq!(unique.len(), 2);
    assert!(resent.iter().all(|u| u.provider.is_some()));
    for update in &resent {
        let properties = update.properties.as_ref().unwrap();
        assert_eq!(
            properties.name.as_deref(),
            Some(format!("iPhone {}", update.udid).as_str())
        );
        assert_eq!(properties.product.as_deref(), Some("iPhone14,2"));
        assert_eq!(properties.brand.as_deref(), Some("Apple"));
        assert_eq!(properties.version.as_deref(), Some("16.0"));
    }
}

#[tokio::test]
async fn replug_sequence_keeps_one_lifecycle() {
    let provider = provider(47450..47500, MockEndpointFactory::new()).await;
    let events = futures::stream::iter(vec![
        PresenceEvent::plugged("ABC123"),
        PresenceEvent::plugged("ABC123"),
        PresenceEvent::unplugged("ABC123"),
        PresenceEvent::plugged("ABC123"),
        PresenceEvent::plugged("ffffffffffffffffff00"),
    ]);

    provider.fleet.run(events).await;
    assert_eq!(provider.fleet.len(), 1);
    wait_ready(&provider, "ABC123").await;

    assert_eq!(provider.ports.outstanding(), 1);
    let body: Value = provider.server.get("/devices").await.json();
    assert_eq!(body["devices"].as_array().unwrap().len(), 1);
    assert_port_invariant(&body);

    let health: Value = provider.server.get("/health").await.json();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["devices"], 1);
    assert_eq!(health["ready"], 1);
}
