//! Apply pipeline and reconciler end-to-end tests

use chrono::Utc;
use hubfly_e2e::TestAppliance;
use hubfly_model::{ResourceStatus, Site, SiteSpec, StreamSpec};
use hubfly_server::{Artifact, JobState};

/// Initialize tracing for tests
fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hubfly_server=debug,hubfly_e2e=debug")
        .with_test_writer()
        .try_init();
}

fn spec(domain: &str, upstream: &str) -> SiteSpec {
    SiteSpec {
        domain: domain.to_string(),
        upstreams: vec![upstream.to_string()],
        ..Default::default()
    }
}

async fn create_site(app: &TestAppliance, domain: &str, upstream: &str) {
    app.control
        .create_site(spec(domain, upstream))
        .unwrap()
        .settle()
        .await;
}

async fn update_site(app: &TestAppliance, domain: &str, upstream: &str) {
    app.control
        .update_site(domain, spec(domain, upstream))
        .unwrap()
        .settle()
        .await;
}

#[tokio::test]
async fn test_reload_failure_restores_previous_version() {
    init_test();
    let app = TestAppliance::start();
    create_site(&app, "a.test", "10.0.0.2:80").await;
    let before = app.live_site("a.test").unwrap();

    app.engine.fail_next_reloads(1);
    update_site(&app, "a.test", "10.0.0.3:80").await;

    let site = app.control.get_site("a.test").unwrap();
    assert_eq!(site.status, ResourceStatus::Error);
    assert!(site
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("previous version restored"));
    assert_eq!(app.live_site("a.test").unwrap(), before);

    // the next pass picks the errored site up again
    let report = app.reconciler().run_once().await.unwrap();
    assert_eq!(report.sites, vec!["a.test".to_string()]);
    assert_eq!(app.control.get_site("a.test").unwrap().status, ResourceStatus::Active);
    assert!(app.live_site("a.test").unwrap().contains("10.0.0.3:80"));
}

#[tokio::test]
async fn test_failed_rollback_is_reported_as_divergence() {
    init_test();
    let app = TestAppliance::start();
    create_site(&app, "b.test", "10.0.0.2:80").await;

    app.engine.fail_next_reloads(2);
    update_site(&app, "b.test", "10.0.0.3:80").await;

    let site = app.control.get_site("b.test").unwrap();
    assert_eq!(site.status, ResourceStatus::Error);
    assert!(site
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("LIVE CONFIGURATION DIVERGED"));
}

#[tokio::test]
async fn test_new_artifact_removed_when_first_reload_fails() {
    init_test();
    let app = TestAppliance::start();

    app.engine.fail_next_reloads(1);
    create_site(&app, "new.test", "10.0.0.2:80").await;

    assert_eq!(
        app.control.get_site("new.test").unwrap().status,
        ResourceStatus::Error
    );
    assert!(app.live_site("new.test").is_none());
}

#[tokio::test]
async fn test_history_is_bounded() {
    init_test();
    let app = TestAppliance::start_with(|config| config.history_depth = 2);
    create_site(&app, "h.test", "10.0.0.1:80").await;
    for n in 2..=5 {
        update_site(&app, "h.test", &format!("10.0.0.{}:80", n)).await;
    }

    let pipeline = app.control.provisioner().pipeline();
    let history = pipeline
        .history(&Artifact::Site("h.test".into()))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(app.live_site("h.test").unwrap().contains("10.0.0.5:80"));
}

#[tokio::test]
async fn test_validation_sees_every_live_artifact() {
    init_test();
    let app = TestAppliance::start();
    create_site(&app, "one.test", "10.0.0.1:80").await;
    app.control
        .create_stream(StreamSpec {
            upstream: "10.0.0.5:5432".to_string(),
            listen_port: Some(30002),
            ..Default::default()
        })
        .unwrap()
        .settle()
        .await;
    create_site(&app, "two.test", "10.0.0.2:80").await;

    let files = app.engine.last_validation().unwrap();
    assert_eq!(files.len(), 3);
    assert!(files.iter().any(|f| f.ends_with("one.test.conf")));
    assert!(files.iter().any(|f| f.ends_with("30002.conf")));
}

#[tokio::test]
async fn test_reconciler_repairs_tampered_site() {
    init_test();
    let app = TestAppliance::start();
    create_site(&app, "c.test", "10.0.0.2:80").await;
    let expected = app.live_site("c.test").unwrap();

    app.write_live(&Artifact::Site("c.test".into()), "server {}\n");
    let report = app.reconciler().run_once().await.unwrap();

    assert_eq!(report.sites, vec!["c.test".to_string()]);
    assert_eq!(app.live_site("c.test").unwrap(), expected);

    // second pass finds nothing
    let report = app.reconciler().run_once().await.unwrap();
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test]
async fn test_reconciler_removes_orphans() {
    init_test();
    let app = TestAppliance::start();
    create_site(&app, "kept.test", "10.0.0.2:80").await;

    app.write_live(&Artifact::Site("orphan.test".into()), "server {}\n");
    app.write_live(&Artifact::StreamPort(30008), "server {}\n");

    let report = app.reconciler().run_once().await.unwrap();
    assert_eq!(report.orphans, vec!["site orphan.test".to_string()]);
    assert_eq!(report.ports, vec![30008]);
    assert!(app.live_site("orphan.test").is_none());
    assert!(app.live_port(30008).is_none());
    assert!(app.live_site("kept.test").is_some());
}

#[tokio::test]
async fn test_orphan_removal_keeps_site_created_meanwhile() {
    init_test();
    let app = TestAppliance::start();

    // spotted without a record, then created before the removal runs
    app.write_live(&Artifact::Site("late.test".into()), "server {}\n");
    let accepted = app
        .control
        .create_site(spec("late.test", "10.0.0.2:80"))
        .unwrap();
    let removal = app
        .control
        .provisioner()
        .enqueue_orphan_removal("late.test");
    accepted.settle().await;

    let record = removal.wait().await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(app.control.get_site("late.test").unwrap().status, ResourceStatus::Active);
    assert!(app.live_site("late.test").unwrap().contains("10.0.0.2:80"));
}

#[tokio::test]
async fn test_reconciler_resumes_interrupted_provisioning() {
    init_test();
    let app = TestAppliance::start();

    // a record left in provisioning with no job, as after a crash
    let store = app.control.provisioner().store();
    let site = Site::from_spec(spec("d.test", "10.0.0.2:80"), Utc::now()).unwrap();
    store.save_site(&site).unwrap();
    assert!(app.live_site("d.test").is_none());

    let report = app.reconciler().run_once().await.unwrap();
    assert_eq!(report.sites, vec!["d.test".to_string()]);
    assert_eq!(app.control.get_site("d.test").unwrap().status, ResourceStatus::Active);
    assert!(app.live_site("d.test").is_some());
}
