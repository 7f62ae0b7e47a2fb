//! Stream end-to-end tests

use std::collections::HashSet;

use hubfly_e2e::harness::{TEST_PORT_END, TEST_PORT_START};
use hubfly_e2e::TestAppliance;
use hubfly_model::{Protocol, ResourceStatus, Stream, StreamSpec};
use hubfly_server::{ControlError, JobState};

/// Initialize tracing for tests
fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hubfly_server=debug,hubfly_e2e=debug")
        .with_test_writer()
        .try_init();
}

fn spec(upstream: &str, port: Option<u16>, domain: Option<&str>) -> StreamSpec {
    StreamSpec {
        upstream: upstream.to_string(),
        listen_port: port,
        domain: domain.map(str::to_string),
        ..Default::default()
    }
}

async fn create(app: &TestAppliance, spec: StreamSpec) -> Stream {
    let (stream, jobs) = app
        .control
        .create_stream(spec)
        .expect("Stream rejected")
        .settle()
        .await;
    assert!(jobs.iter().all(|j| j.state == JobState::Completed), "{:?}", jobs);
    app.control.get_stream(&stream.id).unwrap()
}

#[tokio::test]
async fn test_auto_port_direct_listener() {
    init_test();
    let app = TestAppliance::start();

    let stream = create(&app, spec("10.0.0.2:5432", None, None)).await;
    assert_eq!(stream.listen_port, TEST_PORT_START);
    assert_eq!(stream.id, format!("stream-{}", TEST_PORT_START));
    assert_eq!(stream.status, ResourceStatus::Active);

    let live = app.live_port(TEST_PORT_START).unwrap();
    assert!(live.contains(&format!("listen {};", TEST_PORT_START)));
    assert!(live.contains("proxy_pass 10.0.0.2:5432;"));
    assert!(!live.contains("ssl_preread"));

    // next auto assignment skips the port in use
    let second = create(&app, spec("10.0.0.3:6379", None, None)).await;
    assert_eq!(second.listen_port, TEST_PORT_START + 1);
}

#[tokio::test]
async fn test_second_stream_switches_port_to_sni() {
    init_test();
    let app = TestAppliance::start();
    let port = 30005;

    create(&app, spec("10.0.0.9:443", Some(port), None)).await;
    create(&app, spec("10.0.0.2:443", Some(port), Some("A.Test"))).await;
    create(&app, spec("10.0.0.3:443", Some(port), Some("b.test"))).await;

    let live = app.live_port(port).unwrap();
    assert!(live.contains("ssl_preread on;"));
    assert!(live.contains("a.test 10.0.0.2:443;"));
    assert!(live.contains("b.test 10.0.0.3:443;"));
    assert!(live.contains("default 10.0.0.9:443;"));
    assert!(live.contains(&format!("proxy_pass $hubfly_stream_{};", port)));

    // generated ids stay unique on a shared port
    let streams = app.control.list_streams().unwrap();
    assert_eq!(streams.len(), 3);
    assert_eq!(streams[0].id, format!("stream-{}", port));
    assert!(streams[1].id.starts_with(&format!("stream-{}-", port)));
    assert_ne!(streams[1].id, streams[2].id);
}

#[tokio::test]
async fn test_deleting_last_stream_removes_listener() {
    init_test();
    let app = TestAppliance::start();
    let port = 30003;

    let direct = create(&app, spec("10.0.0.9:443", Some(port), None)).await;
    let routed = create(&app, spec("10.0.0.2:443", Some(port), Some("a.test"))).await;

    app.control.delete_stream(&routed.id).unwrap().settle().await;
    let live = app.live_port(port).unwrap();
    assert!(!live.contains("ssl_preread"));
    assert!(live.contains("proxy_pass 10.0.0.9:443;"));

    app.control.delete_stream(&direct.id).unwrap().settle().await;
    assert!(app.live_port(port).is_none());
    assert!(app.control.list_streams().unwrap().is_empty());
}

#[tokio::test]
async fn test_protocol_mismatch_rejected() {
    init_test();
    let app = TestAppliance::start();
    let port = 30004;
    create(&app, spec("10.0.0.2:443", Some(port), None)).await;
    let before = app.live_snapshot();

    let result = app.control.create_stream(StreamSpec {
        protocol: Protocol::Udp,
        ..spec("10.0.0.53:53", Some(port), None)
    });
    assert!(matches!(result, Err(ControlError::Conflict(_))));
    assert_eq!(app.control.list_streams().unwrap().len(), 1);
    assert_eq!(app.live_snapshot(), before);
}

#[tokio::test]
async fn test_udp_listener_cannot_be_shared() {
    init_test();
    let app = TestAppliance::start();
    let port = 30006;

    let dns = create(
        &app,
        StreamSpec {
            protocol: Protocol::Udp,
            ..spec("10.0.0.53:53", Some(port), None)
        },
    )
    .await;
    assert!(app.live_port(port).unwrap().contains(&format!("listen {} udp;", port)));
    assert_eq!(dns.protocol, Protocol::Udp);

    let result = app.control.create_stream(StreamSpec {
        protocol: Protocol::Udp,
        ..spec("10.0.0.54:53", Some(port), None)
    });
    assert!(matches!(result, Err(ControlError::Conflict(_))));
}

#[tokio::test]
async fn test_site_ports_are_reserved() {
    init_test();
    let app = TestAppliance::start();

    for port in [80, 443] {
        let result = app.control.create_stream(spec("10.0.0.2:8080", Some(port), None));
        assert!(matches!(result, Err(ControlError::Conflict(_))), "port {}", port);
    }
}

#[tokio::test]
async fn test_duplicate_server_name_on_port_rejected() {
    init_test();
    let app = TestAppliance::start();
    let port = 30007;
    create(&app, spec("10.0.0.2:443", Some(port), Some("a.test"))).await;

    let result = app
        .control
        .create_stream(spec("10.0.0.3:443", Some(port), Some("a.test")));
    assert!(matches!(result, Err(ControlError::Conflict(_))));
}

#[tokio::test]
async fn test_port_range_exhaustion() {
    init_test();
    let app = TestAppliance::start_with(|config| {
        config.stream_port_range = (TEST_PORT_START, TEST_PORT_START + 1);
    });

    create(&app, spec("10.0.0.2:1", None, None)).await;
    create(&app, spec("10.0.0.2:2", None, None)).await;
    let result = app.control.create_stream(spec("10.0.0.2:3", None, None));
    assert!(matches!(result, Err(ControlError::PortsExhausted { .. })));
}

#[tokio::test]
async fn test_failed_port_rebuild_leaves_streams_as_they_were() {
    init_test();
    let app = TestAppliance::start();
    let port = 30008;
    let first = create(&app, spec("10.0.0.2:443", Some(port), Some("a.test"))).await;
    let before = app.live_port(port).unwrap();

    app.engine.reject_containing("10.0.0.66");
    let (second, jobs) = app
        .control
        .create_stream(spec("10.0.0.66:443", Some(port), Some("b.test")))
        .unwrap()
        .settle()
        .await;
    assert_eq!(jobs[0].state, JobState::Failed);
    assert!(jobs[0]
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("10.0.0.66"));

    assert_eq!(
        app.control.get_stream(&second.id).unwrap().status,
        ResourceStatus::Provisioning
    );
    assert_eq!(
        app.control.get_stream(&first.id).unwrap().status,
        ResourceStatus::Active
    );
    assert_eq!(app.live_port(port).unwrap(), before);

    // rebuilt on the next pass once the engine accepts it
    app.engine.clear_rejection();
    let report = app.reconciler().run_once().await.unwrap();
    assert_eq!(report.ports, vec![port]);
    assert_eq!(
        app.control.get_stream(&second.id).unwrap().status,
        ResourceStatus::Active
    );
    assert!(app.live_port(port).unwrap().contains("b.test 10.0.0.66:443;"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_control_planes_assign_distinct_ports() {
    init_test();
    let app = TestAppliance::start();
    let planes = [app.control.clone(), app.sibling_control()];

    let tasks: Vec<_> = planes
        .into_iter()
        .enumerate()
        .map(|(plane, control)| {
            tokio::task::spawn_blocking(move || {
                (0..4)
                    .map(|n| {
                        let upstream = format!("10.0.{}.{}:5432", plane, n + 2);
                        control
                            .create_stream(spec(&upstream, None, None))
                            .expect("Stream rejected")
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for task in tasks {
        for accepted in task.await.unwrap() {
            let (_, jobs) = accepted.settle().await;
            assert!(jobs.iter().all(|j| j.state == JobState::Completed), "{:?}", jobs);
        }
    }

    let streams = app.control.list_streams().unwrap();
    assert_eq!(streams.len(), 8);
    let ports: HashSet<u16> = streams.iter().map(|s| s.listen_port).collect();
    let ids: HashSet<&str> = streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ports.len(), 8);
    assert_eq!(ids.len(), 8);
    for stream in &streams {
        assert_eq!(stream.status, ResourceStatus::Active);
        let live = app.live_port(stream.listen_port).unwrap();
        assert!(live.contains(&format!("proxy_pass {};", stream.upstream)));
    }
}

#[tokio::test]
async fn test_moving_stream_rebuilds_both_ports() {
    init_test();
    let app = TestAppliance::start();
    let (from, to) = (30001, TEST_PORT_END);

    let stay = create(&app, spec("10.0.0.9:443", Some(from), None)).await;
    let mover = create(&app, spec("10.0.0.2:443", Some(from), Some("a.test"))).await;
    assert!(app.live_port(from).unwrap().contains("ssl_preread on;"));

    let (_, jobs) = app
        .control
        .update_stream(&mover.id, spec("10.0.0.2:443", Some(to), Some("a.test")))
        .unwrap()
        .settle()
        .await;
    assert_eq!(jobs.len(), 2);

    let old = app.live_port(from).unwrap();
    assert!(!old.contains("a.test"));
    assert!(old.contains(&format!("proxy_pass {};", stay.upstream)));

    let new = app.live_port(to).unwrap();
    assert!(new.contains("a.test 10.0.0.2:443;"));
    let moved = app.control.get_stream(&mover.id).unwrap();
    assert_eq!(moved.listen_port, to);
    assert_eq!(moved.status, ResourceStatus::Active);
}
