//! Rewind engine behavior against the dry-run gateway: exclusivity,
//! cooperative stop, envelope aborts, and live replay recording.

use std::sync::Arc;
use std::time::Duration;

use robogate_core::config::GatewayConfig;
use robogate_core::rewind::RewindRequest;
use robogate_core::trajectory::{WaypointKind, WaypointSource};
use robogate_core::GatewayError;
use robogate_daemon::Gateway;

fn joints(first: f64) -> [f64; 7] {
    [first, -0.785, 0.0, -2.356, 0.0, 1.571, 0.785]
}

async fn gateway(chunk_duration: Duration) -> Arc<Gateway> {
    let mut config = GatewayConfig::default();
    config.rewind.chunk_duration = chunk_duration;
    config.rewind.settle_time = Duration::ZERO;
    config.services.enabled = false;
    let gateway = Gateway::dry_run(config).unwrap();
    gateway.connect_backends().await;
    gateway
}

fn record_joint_targets(gateway: &Gateway, count: usize) {
    let mut recorder = gateway.recorder.lock().unwrap();
    for i in 0..count {
        #[allow(clippy::cast_precision_loss)]
        recorder.record(
            WaypointKind::ArmJoint(joints(0.1 * i as f64)),
            WaypointSource::Command,
        );
    }
}

#[tokio::test]
async fn test_second_rewind_is_busy_and_makes_no_calls() {
    let gateway = gateway(Duration::from_secs(2)).await;
    record_joint_targets(&gateway, 10);

    let engine = Arc::clone(&gateway.rewind);
    let first = tokio::spawn(async move { engine.rewind(RewindRequest::Steps(10), false).await });

    // Let the first replay take the exclusivity lock.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.rewind.is_rewinding());

    let second = gateway.rewind.rewind(RewindRequest::Steps(1), false).await;
    assert!(matches!(second, Err(GatewayError::Busy)));

    // Cooperative stop: the first replay returns in the stopped state with
    // a partial count.
    gateway.rewind.stop();
    let result = first.await.unwrap().unwrap();
    assert!(result.stopped);
    assert!(!result.success);
    assert!(result.steps_rewound < 10);
    assert!(!gateway.rewind.is_rewinding());
}

#[tokio::test]
async fn test_envelope_abort_returns_partial_count() {
    let gateway = gateway(Duration::from_millis(100)).await;

    // Oldest first: an out-of-bounds base pose, then a good arm target.
    // Reverse replay hits the arm target first, then aborts on the base
    // pose.
    {
        let mut recorder = gateway.recorder.lock().unwrap();
        recorder.record(
            WaypointKind::BasePose([9.0, 0.0, 0.0]),
            WaypointSource::Command,
        );
        recorder.record(WaypointKind::ArmJoint(joints(0.1)), WaypointSource::Command);
    }

    let result = gateway
        .rewind
        .rewind(RewindRequest::Steps(2), false)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.steps_rewound, 1);
    assert_eq!(result.error.as_deref(), Some("safety:x_out_of_bounds"));
}

#[tokio::test]
async fn test_live_rewind_reaches_targets_and_records_them() {
    let gateway = gateway(Duration::from_millis(100)).await;
    record_joint_targets(&gateway, 3);

    let result = gateway
        .rewind
        .rewind(RewindRequest::Steps(2), false)
        .await
        .unwrap();
    assert!(result.success, "rewind failed: {:?}", result.error);
    assert_eq!(result.steps_rewound, 2);

    // The simulated arm ends at the oldest replayed target.
    let arm = gateway.arm.get_state().await.unwrap();
    assert!((arm.q[0] - 0.1).abs() < 1e-6);

    // Replayed targets are appended to the trajectory with the rewind
    // source; the original recording is untouched.
    let waypoints = gateway.recorder.lock().unwrap().snapshot();
    assert_eq!(waypoints.len(), 5);
    assert!(matches!(waypoints[2].source, WaypointSource::Command));
    assert!(matches!(waypoints[3].source, WaypointSource::Rewind));
    assert!(matches!(waypoints[4].source, WaypointSource::Rewind));
}

#[tokio::test]
async fn test_resolve_errors_surface_as_invalid_argument() {
    let gateway = gateway(Duration::from_millis(100)).await;
    record_joint_targets(&gateway, 2);

    let err = gateway
        .rewind
        .rewind(RewindRequest::Percentage(150.0), true)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));

    let err = gateway
        .rewind
        .rewind(RewindRequest::ToWaypoint(10), true)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_mixed_kind_replay_splits_chunks() {
    let gateway = gateway(Duration::from_millis(100)).await;
    {
        let mut recorder = gateway.recorder.lock().unwrap();
        recorder.record(WaypointKind::ArmJoint(joints(0.05)), WaypointSource::Command);
        recorder.record(
            WaypointKind::BasePose([0.5, 0.5, 0.0]),
            WaypointSource::Command,
        );
        recorder.record(WaypointKind::GripperWidth(0.02), WaypointSource::Command);
    }

    let result = gateway
        .rewind
        .rewind(RewindRequest::Steps(3), false)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.steps_rewound, 3);

    // All three subsystems ended on their replayed targets.
    assert!((gateway.base.get_state().await.unwrap().pose[0] - 0.5).abs() < 1e-9);
    assert!((gateway.gripper.get_state().await.unwrap().width - 0.02).abs() < 1e-9);
    assert!((gateway.arm.get_state().await.unwrap().q[0] - 0.05).abs() < 1e-6);
}
