//! Trajectory recorder.
//!
//! A bounded, append-only ring of executed motion targets. Command handlers
//! record a waypoint only after the backend accepted the command; the rewind
//! engine reads them back in reverse.
//!
//! Invariants: entry times are non-decreasing, the ring never exceeds its
//! capacity (oldest entries are evicted first), and entries are never
//! mutated after being recorded.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Default waypoint capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// What kind of target a waypoint holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum WaypointKind {
    /// Arm joint positions, radians.
    ArmJoint([f64; 7]),
    /// Arm end-effector pose, 4x4 column-major.
    ArmCartesian([f64; 16]),
    /// Base pose `[x, y, theta]`.
    BasePose([f64; 3]),
    /// Gripper jaw width, meters.
    GripperWidth(f64),
}

impl WaypointKind {
    /// Whether two waypoints target the same subsystem stream.
    #[must_use]
    pub const fn same_stream(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::ArmJoint(_), Self::ArmJoint(_))
                | (Self::ArmCartesian(_), Self::ArmCartesian(_))
                | (Self::BasePose(_), Self::BasePose(_))
                | (Self::GripperWidth(_), Self::GripperWidth(_))
        )
    }
}

/// Who produced a waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointSource {
    /// A direct agent command.
    Command,
    /// The rewind engine replaying history.
    Rewind,
    /// A submitted script acting through the SDK.
    Script,
}

/// One recorded target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Seconds since the recorder was created (monotonic).
    pub t: f64,
    #[serde(flatten)]
    pub kind: WaypointKind,
    pub source: WaypointSource,
}

/// Bounded append-only waypoint ring.
#[derive(Debug)]
pub struct TrajectoryRecorder {
    epoch: Instant,
    capacity: usize,
    entries: VecDeque<Waypoint>,
}

impl TrajectoryRecorder {
    /// Create a recorder with the given capacity (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            epoch: Instant::now(),
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Record a target. Returns the entry's monotonic time.
    ///
    /// Times are forced non-decreasing; if the ring is full the oldest entry
    /// is evicted.
    pub fn record(&mut self, kind: WaypointKind, source: WaypointSource) -> f64 {
        let mut t = self.epoch.elapsed().as_secs_f64();
        if let Some(last) = self.entries.back() {
            if t < last.t {
                t = last.t;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Waypoint { t, kind, source });
        t
    }

    /// Number of recorded waypoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// A copied view of all waypoints, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Waypoint> {
        self.entries.iter().cloned().collect()
    }

    /// A copied view of `[from, to)` (clamped to the valid range).
    #[must_use]
    pub fn slice(&self, from: usize, to: usize) -> Vec<Waypoint> {
        let to = to.min(self.entries.len());
        if from >= to {
            return Vec::new();
        }
        self.entries.range(from..to).cloned().collect()
    }

    /// The last `n` waypoints in reverse chronological order.
    #[must_use]
    pub fn reverse_slice(&self, n: usize) -> Vec<Waypoint> {
        let n = n.min(self.entries.len());
        self.entries.iter().rev().take(n).cloned().collect()
    }

    /// One waypoint by index, oldest first.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.entries.get(index)
    }

    /// Drop every recorded waypoint.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for TrajectoryRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(v: f64) -> WaypointKind {
        WaypointKind::ArmJoint([v, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    #[test]
    fn test_record_and_len() {
        let mut rec = TrajectoryRecorder::new(10);
        assert!(rec.is_empty());
        rec.record(joint(0.0), WaypointSource::Command);
        rec.record(joint(1.0), WaypointSource::Command);
        assert_eq!(rec.len(), 2);
    }

    #[test]
    fn test_times_non_decreasing() {
        let mut rec = TrajectoryRecorder::new(10);
        for i in 0..5 {
            rec.record(joint(f64::from(i)), WaypointSource::Command);
        }
        let snap = rec.snapshot();
        for pair in snap.windows(2) {
            assert!(pair[1].t >= pair[0].t);
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let mut rec = TrajectoryRecorder::new(3);
        for i in 0..5 {
            rec.record(joint(f64::from(i)), WaypointSource::Command);
        }
        assert_eq!(rec.len(), 3);
        let snap = rec.snapshot();
        match snap[0].kind {
            WaypointKind::ArmJoint(q) => assert!((q[0] - 2.0).abs() < f64::EPSILON),
            ref other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_reverse_slice_order() {
        let mut rec = TrajectoryRecorder::new(10);
        for i in 0..4 {
            rec.record(joint(f64::from(i)), WaypointSource::Command);
        }
        let rev = rec.reverse_slice(3);
        let values: Vec<f64> = rev
            .iter()
            .map(|w| match w.kind {
                WaypointKind::ArmJoint(q) => q[0],
                ref other => panic!("unexpected: {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_reverse_slice_clamps_to_len() {
        let mut rec = TrajectoryRecorder::new(10);
        rec.record(joint(0.0), WaypointSource::Command);
        assert_eq!(rec.reverse_slice(100).len(), 1);
    }

    #[test]
    fn test_slice_bounds() {
        let mut rec = TrajectoryRecorder::new(10);
        for i in 0..5 {
            rec.record(joint(f64::from(i)), WaypointSource::Command);
        }
        assert_eq!(rec.slice(1, 3).len(), 2);
        assert_eq!(rec.slice(4, 100).len(), 1);
        assert!(rec.slice(3, 2).is_empty());
    }

    #[test]
    fn test_clear() {
        let mut rec = TrajectoryRecorder::new(10);
        rec.record(joint(0.0), WaypointSource::Script);
        rec.clear();
        assert!(rec.is_empty());
    }
}
