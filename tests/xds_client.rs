//! End-to-end protocol tests against an in-process mock management
//! server: the discovery round trip through the dependency manager,
//! NACK behavior, the does-not-exist timer, reconnect backoff, aggregate
//! cluster cycles, and LRS reporting.

mod common;

use std::time::{Duration, Instant};

use common::*;
use envoy_types::pb::envoy::service::load_stats::v3::LoadStatsResponse;
use meshwire::xds::{ClusterChildren, ClusterResource, ListenerResource};
use meshwire::XdsDependencyManager;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn recv_event<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> T {
    timeout(EVENT_TIMEOUT, rx.recv()).await.expect("timed out waiting for event").expect("channel open")
}

async fn expect_no_event<T: std::fmt::Debug>(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>,
    wait: Duration,
) {
    if let Ok(Some(event)) = timeout(wait, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

#[tokio::test]
async fn single_eds_round_trip_produces_one_snapshot() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingConfigWatcher::new();
    let _manager = XdsDependencyManager::new(
        client.clone(),
        "server.example.com",
        "server.example.com",
        watcher,
    );

    // Initial LDS request carries the node and the listener name.
    let request = server.next_request().await;
    assert_eq!(request.type_url, LISTENER_TYPE_URL);
    assert_eq!(request.resource_names, vec!["server.example.com".to_string()]);
    assert_eq!(request.version_info, "");
    assert_eq!(request.response_nonce, "");
    assert_eq!(request.node.as_ref().map(|n| n.id.as_str()), Some("test-node"));

    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "1",
        "lds-1",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("server.example.com", "route-a"))],
    ));

    let ack = server.next_request().await;
    assert_eq!(ack.type_url, LISTENER_TYPE_URL);
    assert_eq!(ack.version_info, "1");
    assert_eq!(ack.response_nonce, "lds-1");
    assert!(ack.error_detail.is_none());

    let request = server.next_request().await;
    assert_eq!(request.type_url, ROUTE_TYPE_URL);
    assert_eq!(request.resource_names, vec!["route-a".to_string()]);

    server.send(discovery_response(
        ROUTE_TYPE_URL,
        "1",
        "rds-1",
        vec![any_from(ROUTE_TYPE_URL, &route_config("route-a", &["*"], "cluster-c"))],
    ));

    let ack = server.next_request().await;
    assert_eq!(ack.type_url, ROUTE_TYPE_URL);
    assert!(ack.error_detail.is_none());

    let request = server.next_request().await;
    assert_eq!(request.type_url, CLUSTER_TYPE_URL);
    assert_eq!(request.resource_names, vec!["cluster-c".to_string()]);

    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "1",
        "cds-1",
        vec![any_from(CLUSTER_TYPE_URL, &eds_cluster("cluster-c", "eds-service"))],
    ));

    let ack = server.next_request().await;
    assert_eq!(ack.type_url, CLUSTER_TYPE_URL);
    assert!(ack.error_detail.is_none());

    let request = server.next_request().await;
    assert_eq!(request.type_url, ENDPOINT_TYPE_URL);
    assert_eq!(request.resource_names, vec!["eds-service".to_string()]);

    server.send(discovery_response(
        ENDPOINT_TYPE_URL,
        "1",
        "eds-1",
        vec![any_from(
            ENDPOINT_TYPE_URL,
            &cluster_load_assignment("eds-service", "127.0.0.1", 443),
        )],
    ));

    let event = recv_event(&mut events).await;
    let config = match event {
        ConfigEvent::Update(config) => config,
        other => panic!("expected config update, got {:?}", other),
    };
    assert_eq!(config.virtual_host().domains, vec!["*".to_string()]);
    assert_eq!(config.clusters.len(), 1);
    let cluster = config.clusters["cluster-c"].as_ref().expect("cluster OK");
    match &cluster.children {
        ClusterChildren::Endpoints { endpoints, resolution_note } => {
            assert!(resolution_note.is_empty());
            let endpoints = endpoints.as_ref().expect("endpoints present");
            let locality = endpoints.priorities[0].localities.values().next().unwrap();
            assert_eq!(locality.endpoints.len(), 1);
            assert_eq!(locality.endpoints[0].address, "ipv4:127.0.0.1:443");
        }
        other => panic!("expected leaf cluster, got {:?}", other),
    }

    // Exactly one snapshot.
    expect_no_event(&mut events, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn nack_preserves_prior_good_value() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingWatcher::<ClusterResource>::new();
    let _handle = client.watch::<ClusterResource>("cluster-c", watcher);

    let request = server.next_request().await;
    assert_eq!(request.type_url, CLUSTER_TYPE_URL);

    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "1",
        "n1",
        vec![any_from(CLUSTER_TYPE_URL, &eds_cluster("cluster-c", "eds-service"))],
    ));

    let ack = server.next_request().await;
    assert_eq!(ack.version_info, "1");
    assert_eq!(ack.response_nonce, "n1");
    assert!(ack.error_detail.is_none());

    let event = recv_event(&mut events).await;
    let good = match event {
        WatchEvent::Changed(resource) => resource,
        other => panic!("expected resource, got {:?}", other),
    };

    // A later invalid payload is NACKed with the previous version, and the
    // watcher hears nothing.
    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "2",
        "n2",
        vec![any_from(CLUSTER_TYPE_URL, &invalid_cluster("cluster-c"))],
    ));

    let nack = server.next_request().await;
    assert_eq!(nack.type_url, CLUSTER_TYPE_URL);
    assert_eq!(nack.response_nonce, "n2");
    assert_eq!(nack.version_info, "1");
    let error = nack.error_detail.expect("NACK carries error detail");
    assert!(error.message.contains("cluster-c"), "detail: {}", error.message);

    expect_no_event(&mut events, Duration::from_millis(300)).await;

    // New watchers still get the stale good value.
    let (second_watcher, mut second_events) = RecordingWatcher::<ClusterResource>::new();
    let _second = client.watch::<ClusterResource>("cluster-c", second_watcher);
    match recv_event(&mut second_events).await {
        WatchEvent::Changed(resource) => assert_eq!(resource, good),
        other => panic!("expected cached resource, got {:?}", other),
    }
}

#[tokio::test]
async fn does_not_exist_timer_fires_once_and_recovers() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingWatcher::<ListenerResource>::new();
    let _handle = client.watch_listener("listener-x", watcher);

    let request = server.next_request().await;
    assert_eq!(request.type_url, LISTENER_TYPE_URL);

    // No response within the (shortened) timer: exactly one notification.
    match recv_event(&mut events).await {
        WatchEvent::DoesNotExist => {}
        other => panic!("expected does-not-exist, got {:?}", other),
    }
    expect_no_event(&mut events, Duration::from_millis(400)).await;

    // A subsequent response carrying the resource clears the state.
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "1",
        "n1",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-x", "route-a"))],
    ));
    match recv_event(&mut events).await {
        WatchEvent::Changed(_) => {}
        other => panic!("expected resource, got {:?}", other),
    }
}

#[tokio::test]
async fn reconnect_backoff_grows_and_resets() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingWatcher::<ListenerResource>::new();
    let _handle = client.watch::<ListenerResource>("listener-x", watcher);

    server.next_connection().await;
    server.next_request().await;

    // Three aborts with no successful responses: delays must grow
    // geometrically (the jitter windows for consecutive attempts do not
    // overlap).
    let mut delays = Vec::new();
    for _ in 0..3 {
        server.abort_stream();
        let start = Instant::now();
        timeout(EVENT_TIMEOUT, server.next_connection()).await.expect("reconnect");
        delays.push(start.elapsed());
        server.next_request().await;
    }
    assert!(delays[0] >= Duration::from_millis(30), "first delay too short: {:?}", delays);
    assert!(delays[1] > delays[0], "delays must grow: {:?}", delays);
    assert!(delays[2] > delays[1], "delays must grow: {:?}", delays);
    assert!(delays[2] < Duration::from_secs(2), "delay exceeds cap: {:?}", delays);

    // One successful response resets the backoff. Earlier aborts queued
    // transient-error notifications; skip past them.
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "1",
        "n1",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-x", "route-a"))],
    ));
    loop {
        match recv_event(&mut events).await {
            WatchEvent::Changed(_) => break,
            WatchEvent::Error(_) | WatchEvent::DoesNotExist => continue,
        }
    }
    server.next_request().await; // ACK

    server.abort_stream();
    let start = Instant::now();
    timeout(EVENT_TIMEOUT, server.next_connection()).await.expect("reconnect");
    let reset_delay = start.elapsed();
    assert!(
        reset_delay < delays[2],
        "backoff did not reset: {:?} vs {:?}",
        reset_delay,
        delays[2]
    );
}

#[tokio::test]
async fn aggregate_cluster_cycle_yields_non_ok_entries() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingConfigWatcher::new();
    let _manager = XdsDependencyManager::new(client.clone(), "example.com", "lds-a", watcher);

    server.next_request().await; // LDS sub
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "1",
        "l1",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("lds-a", "route-a"))],
    ));
    server.next_request().await; // LDS ACK
    server.next_request().await; // RDS sub
    server.send(discovery_response(
        ROUTE_TYPE_URL,
        "1",
        "r1",
        vec![any_from(ROUTE_TYPE_URL, &route_config("route-a", &["*"], "agg-a"))],
    ));
    server.next_request().await; // RDS ACK

    let request = server.next_request().await; // CDS sub for A
    assert_eq!(request.resource_names, vec!["agg-a".to_string()]);
    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "1",
        "c1",
        vec![any_from(CLUSTER_TYPE_URL, &aggregate_cluster("agg-a", &["agg-b"]))],
    ));
    server.next_request().await; // CDS ACK

    // The client expands the aggregate and subscribes to B; answer with
    // the full SotW set closing the cycle.
    let request = server.next_request().await;
    assert_eq!(request.type_url, CLUSTER_TYPE_URL);
    let mut names = request.resource_names.clone();
    names.sort();
    assert_eq!(names, vec!["agg-a".to_string(), "agg-b".to_string()]);
    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "2",
        "c2",
        vec![
            any_from(CLUSTER_TYPE_URL, &aggregate_cluster("agg-a", &["agg-b"])),
            any_from(CLUSTER_TYPE_URL, &aggregate_cluster("agg-b", &["agg-a"])),
        ],
    ));

    let config = loop {
        match recv_event(&mut events).await {
            ConfigEvent::Update(config) => break config,
            other => panic!("expected config update, got {:?}", other),
        }
    };
    assert!(config.clusters.contains_key("agg-a"));
    assert!(config.clusters.contains_key("agg-b"));
    // The cycle terminates within the depth bound and surfaces as non-OK
    // entries rather than blocking the snapshot.
    let error = config.clusters["agg-a"].as_ref().expect_err("cycle must not be OK");
    assert!(
        error.contains("no leaf clusters") || error.contains("exceeds max depth"),
        "unexpected error: {}",
        error
    );
}

#[tokio::test]
async fn lrs_reports_drops_and_locality_stats() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);

    let drop_stats = client.drop_stats("cluster-c", "eds-service");
    drop_stats.add_uncategorized_drops();
    drop_stats.add_drop("lb");
    drop_stats.add_drop("lb");

    let locality = meshwire::xds::LocalityName {
        region: "region1".to_string(),
        zone: "zone1".to_string(),
        sub_zone: String::new(),
    };
    let locality_stats = client.locality_stats("cluster-c", "eds-service", locality);
    locality_stats.add_call_started();
    locality_stats.add_call_finished(false);

    // Initial LRS request carries the node.
    let initial = server.next_lrs_request().await;
    assert_eq!(initial.node.as_ref().map(|n| n.id.as_str()), Some("test-node"));
    assert!(initial.cluster_stats.is_empty());

    server.send_lrs(LoadStatsResponse {
        send_all_clusters: true,
        load_reporting_interval: Some(envoy_types::pb::google::protobuf::Duration {
            seconds: 0,
            nanos: 100_000_000,
        }),
        ..Default::default()
    });

    let report = timeout(EVENT_TIMEOUT, server.next_lrs_request())
        .await
        .expect("load report");
    assert_eq!(report.cluster_stats.len(), 1);
    let stats = &report.cluster_stats[0];
    assert_eq!(stats.cluster_name, "cluster-c");
    assert_eq!(stats.cluster_service_name, "eds-service");
    assert_eq!(stats.total_dropped_requests, 3);
    assert_eq!(stats.dropped_requests.len(), 1);
    assert_eq!(stats.dropped_requests[0].category, "lb");
    assert_eq!(stats.dropped_requests[0].dropped_count, 2);
    let locality_report = &stats.upstream_locality_stats[0];
    assert_eq!(locality_report.total_issued_requests, 1);
    assert_eq!(locality_report.total_successful_requests, 1);
    assert_eq!(locality_report.total_requests_in_progress, 0);
    assert!(stats.load_report_interval.is_some());
}

#[tokio::test]
async fn identical_payloads_do_not_renotify() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingWatcher::<ListenerResource>::new();
    let _handle = client.watch::<ListenerResource>("listener-x", watcher);

    server.next_request().await;
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "1",
        "n1",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-x", "route-a"))],
    ));
    match recv_event(&mut events).await {
        WatchEvent::Changed(_) => {}
        other => panic!("expected resource, got {:?}", other),
    }
    server.next_request().await; // ACK v1

    // Same contents under a new version: ACKed, no notification.
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "2",
        "n2",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-x", "route-a"))],
    ));
    let ack = server.next_request().await;
    assert_eq!(ack.version_info, "2");
    assert!(ack.error_detail.is_none());
    expect_no_event(&mut events, Duration::from_millis(300)).await;

    // Different contents do notify.
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "3",
        "n3",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-x", "route-b"))],
    ));
    match recv_event(&mut events).await {
        WatchEvent::Changed(_) => {}
        other => panic!("expected resource, got {:?}", other),
    }
}

#[tokio::test]
async fn subscription_set_tracks_watchers() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);

    let (first, _first_events) = RecordingWatcher::<ClusterResource>::new();
    let first_handle = client.watch::<ClusterResource>("cluster-a", first);

    let request = server.next_request().await;
    assert_eq!(request.resource_names, vec!["cluster-a".to_string()]);

    let (second, _second_events) = RecordingWatcher::<ClusterResource>::new();
    let _second_handle = client.watch::<ClusterResource>("cluster-b", second);

    let request = server.next_request().await;
    let mut names = request.resource_names.clone();
    names.sort();
    assert_eq!(names, vec!["cluster-a".to_string(), "cluster-b".to_string()]);

    first_handle.cancel();
    let request = server.next_request().await;
    assert_eq!(request.resource_names, vec!["cluster-b".to_string()]);
}

#[tokio::test]
async fn dump_config_reports_csds_statuses() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher, mut events) = RecordingWatcher::<ClusterResource>::new();
    let _handle = client.watch::<ClusterResource>("cluster-c", watcher);

    // Subscribed, nothing delivered yet.
    server.next_request().await;
    let dump = client.dump_config();
    assert_eq!(dump["node"]["id"], "test-node");
    let entry = &dump["generic_xds_configs"][0];
    assert_eq!(entry["type_url"], CLUSTER_TYPE_URL);
    assert_eq!(entry["name"], "cluster-c");
    assert_eq!(entry["client_status"], "REQUESTED");

    // Accepted payload.
    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "1",
        "n1",
        vec![any_from(CLUSTER_TYPE_URL, &eds_cluster("cluster-c", "eds-service"))],
    ));
    match recv_event(&mut events).await {
        WatchEvent::Changed(_) => {}
        other => panic!("expected resource, got {:?}", other),
    }
    let ack = server.next_request().await;
    assert!(ack.error_detail.is_none());
    let dump = client.dump_config();
    let entry = &dump["generic_xds_configs"][0];
    assert_eq!(entry["client_status"], "ACKED");
    assert_eq!(entry["version_info"], "1");
    assert!(entry["last_updated"].is_string());
    assert!(entry["serialized_byte_length"].as_u64().unwrap() > 0);
    assert!(entry.get("error_state").is_none());

    // Rejected payload: stale value retained, diagnostics recorded.
    server.send(discovery_response(
        CLUSTER_TYPE_URL,
        "2",
        "n2",
        vec![any_from(CLUSTER_TYPE_URL, &invalid_cluster("cluster-c"))],
    ));
    let nack = server.next_request().await;
    assert!(nack.error_detail.is_some());
    let dump = client.dump_config();
    let entry = &dump["generic_xds_configs"][0];
    assert_eq!(entry["client_status"], "NACKED");
    assert_eq!(entry["version_info"], "1");
    assert_eq!(entry["error_state"]["version_info"], "2");
    assert!(entry["error_state"]["details"]
        .as_str()
        .unwrap()
        .contains("DiscoveryType"));
}

#[tokio::test]
async fn sotw_omission_marks_listener_does_not_exist() {
    let server = MockXdsServer::spawn().await;
    let client = test_client(&server);
    let (watcher_a, mut events_a) = RecordingWatcher::<ListenerResource>::new();
    let _handle_a = client.watch::<ListenerResource>("listener-a", watcher_a);
    let request = server.next_request().await;
    assert_eq!(request.resource_names, vec!["listener-a".to_string()]);

    let (watcher_b, mut events_b) = RecordingWatcher::<ListenerResource>::new();
    let _handle_b = client.watch::<ListenerResource>("listener-b", watcher_b);
    let request = server.next_request().await;
    let mut names = request.resource_names.clone();
    names.sort();
    assert_eq!(names, vec!["listener-a".to_string(), "listener-b".to_string()]);

    // Both present initially.
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "1",
        "n1",
        vec![
            any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-a", "route-a")),
            any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-b", "route-b")),
        ],
    ));
    match recv_event(&mut events_a).await {
        WatchEvent::Changed(_) => {}
        other => panic!("expected resource, got {:?}", other),
    }
    match recv_event(&mut events_b).await {
        WatchEvent::Changed(_) => {}
        other => panic!("expected resource, got {:?}", other),
    }

    // Next SotW response omits listener-b: it no longer exists.
    server.send(discovery_response(
        LISTENER_TYPE_URL,
        "2",
        "n2",
        vec![any_from(LISTENER_TYPE_URL, &listener_with_rds("listener-a", "route-a"))],
    ));
    match recv_event(&mut events_b).await {
        WatchEvent::DoesNotExist => {}
        other => panic!("expected does-not-exist, got {:?}", other),
    }
    expect_no_event(&mut events_a, Duration::from_millis(300)).await;
}
