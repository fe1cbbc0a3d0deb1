//! Auto-rewind monitor.
//!
//! A background task that reads published snapshots, applies the safety
//! envelope, and on a violation stops the base and triggers a rewind of the
//! configured step count. It never triggers while a rewind is already
//! active, and it enforces a cooldown between triggers.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use robogate_core::rewind::RewindRequest;
use robogate_core::safety::SafetyEnvelope;
use robogate_core::state::world_ee_position;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::StateAggregator;
use crate::backends::BaseAdapter;
use crate::rewind::RewindEngine;

/// Minimum spacing between monitor-triggered rewinds.
const TRIGGER_COOLDOWN: Duration = Duration::from_secs(3);

/// Monitor status view.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub auto_rewind_enabled: bool,
    pub auto_rewind_steps: usize,
    pub trigger_count: u64,
    pub last_trigger_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Stats {
    trigger_count: u64,
    last_trigger_at: Option<DateTime<Utc>>,
    last_trigger_instant: Option<std::time::Instant>,
}

/// Envelope monitor driving automatic rewinds.
pub struct AutoRewindMonitor {
    engine: Arc<RewindEngine>,
    aggregator: Arc<StateAggregator>,
    base: Arc<BaseAdapter>,
    safety: SafetyEnvelope,
    stats: StdMutex<Stats>,
}

impl AutoRewindMonitor {
    /// Create a monitor over the engine and the snapshot stream.
    #[must_use]
    pub fn new(
        engine: Arc<RewindEngine>,
        aggregator: Arc<StateAggregator>,
        base: Arc<BaseAdapter>,
        safety: SafetyEnvelope,
    ) -> Self {
        Self {
            engine,
            aggregator,
            base,
            safety,
            stats: StdMutex::new(Stats::default()),
        }
    }

    /// Current monitor status.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        let cfg = self.engine.config();
        let stats = self.stats.lock().expect("stats lock");
        MonitorStatus {
            auto_rewind_enabled: cfg.auto_rewind_enabled,
            auto_rewind_steps: cfg.auto_rewind_steps,
            trigger_count: stats.trigger_count,
            last_trigger_at: stats.last_trigger_at,
        }
    }

    /// Monitor loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let cfg = self.engine.config();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(cfg.monitor_interval) => {},
            }

            if !cfg.auto_rewind_enabled || self.engine.is_rewinding() {
                continue;
            }
            let in_cooldown = self
                .stats
                .lock()
                .expect("stats lock")
                .last_trigger_instant
                .is_some_and(|t| t.elapsed() < TRIGGER_COOLDOWN);
            if in_cooldown {
                continue;
            }

            if let Some(reason) = self.violation() {
                self.trigger(&reason, cfg.auto_rewind_steps).await;
            }
        }
    }

    /// Check the latest snapshot against the envelope.
    fn violation(&self) -> Option<String> {
        let snapshot = self.aggregator.latest();

        if !snapshot.base.stale {
            let pose = snapshot.base.state.pose;
            if let Err(v) = self.safety.check_base_position(pose[0], pose[1]) {
                return Some(v.reason);
            }
        }

        if !snapshot.arm.stale && !snapshot.base.stale {
            let ee = world_ee_position(&snapshot.base.state.pose, &snapshot.arm.state.ee_pose);
            if let Err(v) = self.safety.check_ee_position(&ee) {
                return Some(v.reason);
            }
        }

        None
    }

    async fn trigger(&self, reason: &str, steps: usize) {
        warn!(reason, steps, "envelope violation, triggering auto-rewind");
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.trigger_count += 1;
            stats.last_trigger_at = Some(Utc::now());
            stats.last_trigger_instant = Some(std::time::Instant::now());
        }

        // Stop the base immediately, then replay.
        if let Err(e) = self.base.stop().await {
            error!(error = %e, "failed to stop base before auto-rewind");
        }
        match self.engine.rewind(RewindRequest::Steps(steps), false).await {
            Ok(result) if result.success => {
                info!(steps = result.steps_rewound, "auto-rewind complete");
            },
            Ok(result) => {
                error!(
                    steps = result.steps_rewound,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "auto-rewind incomplete"
                );
            },
            Err(e) => error!(error = %e, "auto-rewind failed to start"),
        }
    }
}

#[cfg(test)]
mod tests {
    use robogate_core::config::{
        ArmBackendConfig, BaseBackendConfig, CameraConfig, GripperBackendConfig,
    };
    use robogate_core::rewind::RewindConfig;
    use robogate_core::safety::SafetyConfig;
    use robogate_core::trajectory::TrajectoryRecorder;

    use super::*;
    use crate::backends::{ArmAdapter, CameraAdapter, GripperAdapter};

    async fn monitor() -> (Arc<AutoRewindMonitor>, Arc<BaseAdapter>) {
        let arm = Arc::new(ArmAdapter::new(ArmBackendConfig::default(), true));
        let base = Arc::new(BaseAdapter::new(BaseBackendConfig::default(), true));
        let gripper = Arc::new(GripperAdapter::new(GripperBackendConfig::default(), true));
        let cameras = Arc::new(CameraAdapter::new(CameraConfig::default(), true));
        arm.connect().await.unwrap();
        base.connect().await.unwrap();
        gripper.connect().await.unwrap();

        let aggregator = Arc::new(StateAggregator::new(
            Arc::clone(&arm),
            Arc::clone(&base),
            Arc::clone(&gripper),
            cameras,
            100.0,
            10.0,
            10.0,
            50.0,
        ));
        let recorder = Arc::new(StdMutex::new(TrajectoryRecorder::new(100)));
        let engine = Arc::new(RewindEngine::new(
            arm,
            Arc::clone(&base),
            gripper,
            recorder,
            SafetyEnvelope::default(),
            RewindConfig::default(),
        ));
        (
            Arc::new(AutoRewindMonitor::new(
                engine,
                aggregator,
                Arc::clone(&base),
                SafetyEnvelope::new(SafetyConfig::default()),
            )),
            base,
        )
    }

    #[tokio::test]
    async fn test_no_violation_inside_workspace() {
        let (monitor, _base) = monitor().await;
        assert!(monitor.violation().is_none());
    }

    #[tokio::test]
    async fn test_violation_outside_base_workspace() {
        let (monitor, base) = monitor().await;
        base.move_to(9.0, 0.0, 0.0).await.unwrap();
        monitor.aggregator.poll_once().await;
        monitor.aggregator.publish_now();

        let reason = monitor.violation().expect("violation expected");
        assert_eq!(reason, "safety:x_out_of_bounds");
    }
}
