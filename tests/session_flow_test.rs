//! End-to-end queue flows against the in-memory backend

use queue_client::domain::geo::{offset_north, Geofence};
use queue_client::domain::types::{QueueOutcome, QueueResult, QueueType};
use queue_client::error::LocationError;
use queue_client::infra::config::{AcquisitionConfig, JoinPolicy, SessionConfig};
use queue_client::infra::Metrics;
use queue_client::io::memory::VENUE_DOOR;
use queue_client::io::{
    InMemoryEstimationClient, Operation, ScriptedLocationProvider, ScriptedSample, WatchConfig,
};
use queue_client::services::{
    AcquisitionStatus, JoinFlow, JoinStep, LocationAcquirer, MarkerCatalog, SessionManager,
};
use std::sync::Arc;
use std::time::Duration;

struct World {
    backend: Arc<InMemoryEstimationClient>,
    provider: Arc<ScriptedLocationProvider>,
    metrics: Arc<Metrics>,
    acquirer: Arc<LocationAcquirer>,
    sessions: SessionManager,
    flow: JoinFlow,
}

fn world(samples: Vec<ScriptedSample>, policy: JoinPolicy) -> World {
    let backend = Arc::new(InMemoryEstimationClient::seeded("berghain"));
    let provider = Arc::new(ScriptedLocationProvider::new(samples));
    let metrics = Arc::new(Metrics::new());
    let acquisition = AcquisitionConfig {
        geofence: Some(Geofence::new(VENUE_DOOR, 500.0)),
        ..AcquisitionConfig::default()
    };
    let acquirer = Arc::new(LocationAcquirer::new(provider.clone(), acquisition, metrics.clone()));
    let sessions = SessionManager::new(
        backend.clone(),
        provider.clone(),
        SessionConfig::default(),
        WatchConfig::default(),
        metrics.clone(),
    );
    let flow = JoinFlow::new(acquirer.clone(), sessions.clone(), policy);
    World { backend, provider, metrics, acquirer, sessions, flow }
}

fn approaching_queue() -> Vec<ScriptedSample> {
    let line = offset_north(VENUE_DOOR, 150.0);
    vec![
        ScriptedSample::new(0, line, 80.0),
        ScriptedSample::new(1_000, line, 40.0),
        ScriptedSample::new(2_000, line, 12.0),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_lifecycle() {
    let w = world(approaching_queue(), JoinPolicy::RequireFix);

    let JoinStep::Joined(session) = w.flow.start(QueueType::Main).await else {
        panic!("join with a good fix should succeed");
    };
    assert!(w.sessions.is_reporting());
    assert_eq!(w.provider.active_watches(), 0);
    match w.acquirer.state().status {
        AcquisitionStatus::Success(fix) => {
            assert_eq!(fix.sample.accuracy_meters, 12.0);
            assert!((fix.distance_meters.unwrap() - 150.0).abs() < 1.0);
        }
        other => panic!("unexpected acquisition state {other:?}"),
    }

    // Two reporter ticks
    tokio::time::sleep(Duration::from_secs(245)).await;
    assert_eq!(w.backend.calls(Operation::ReportPosition), 2);
    assert_eq!(w.metrics.position_reports_sent(), 2);

    let catalog = MarkerCatalog::new(w.backend.clone(), "berghain");
    let kiosk = catalog.find(QueueType::Main, "Kiosk").await.unwrap().unwrap();
    let ack = w.sessions.submit_checkpoint(kiosk.id).await.unwrap().unwrap();
    assert_eq!(ack.estimated_wait_minutes, kiosk.typical_wait_minutes);
    assert_eq!(w.sessions.current().unwrap().last_marker_id, Some(kiosk.id));

    let done = w.sessions.submit_result(QueueOutcome::Admitted).await.unwrap();
    assert_eq!(done.id, session.id);
    assert_eq!(done.result, Some(QueueResult::Admitted));
    assert_eq!(done.last_marker_id, Some(kiosk.id));
    assert!(!w.sessions.is_reporting());

    let reports = w.backend.calls(Operation::ReportPosition);
    w.sessions.report_position(VENUE_DOOR).await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(w.backend.calls(Operation::ReportPosition), reports);
    assert_eq!(w.provider.active_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_leave() {
    let w = world(approaching_queue(), JoinPolicy::RequireFix);
    assert!(matches!(w.flow.start(QueueType::GuestList).await, JoinStep::Joined(_)));

    w.sessions.leave().await.unwrap();
    assert!(w.sessions.current().is_none());
    assert_eq!(w.backend.finished_sessions()[0].result, Some(QueueResult::Left));

    assert!(matches!(w.flow.retry(QueueType::Main).await, JoinStep::Joined(_)));
    assert_eq!(w.backend.calls(Operation::Join), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_session_after_restart() {
    let w = world(approaching_queue(), JoinPolicy::RequireFix);
    let JoinStep::Joined(session) = w.flow.start(QueueType::Reentry).await else {
        panic!("join should succeed");
    };
    drop(w.flow);
    drop(w.sessions);

    // Fresh client process against the same backend
    let restarted = SessionManager::new(
        w.backend.clone(),
        w.provider.clone(),
        SessionConfig::default(),
        WatchConfig::default(),
        w.metrics.clone(),
    );
    assert!(restarted.current().is_none());

    let recovered = restarted.fetch_session().await.unwrap().unwrap();
    assert_eq!(recovered.id, session.id);
    assert!(restarted.is_reporting());
}

#[tokio::test(start_paused = true)]
async fn test_far_away_user_cannot_join() {
    let far = offset_north(VENUE_DOOR, 800.0);
    let w = world(vec![ScriptedSample::new(0, far, 5.0)], JoinPolicy::AllowWithoutFix);

    let step = w.flow.start(QueueType::Main).await;

    let JoinStep::LocationRequired { error, can_join_without_location } = step else {
        panic!("expected LocationRequired");
    };
    assert!(matches!(error, LocationError::OutOfGeofence { .. }));
    assert!(!can_join_without_location);
    assert_eq!(w.backend.total_calls(), 0);
    assert!(!w.sessions.is_reporting());
}
