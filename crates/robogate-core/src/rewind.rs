//! Rewind planning.
//!
//! Pure helpers for reverse replay: resolving a rewind request to a step
//! count, partitioning reversed waypoints into same-kind chunks, and the
//! interpolation used when streaming arm chunks. Execution against the
//! adapters lives in the daemon.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trajectory::{Waypoint, WaypointKind};

/// Rewind engine configuration, readable and updatable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewindConfig {
    /// Consecutive same-kind waypoints executed as one streamed motion.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Time budget for executing one chunk.
    #[serde(default = "default_chunk_duration")]
    #[serde(with = "humantime_serde")]
    pub chunk_duration: Duration,

    /// Pause between chunks.
    #[serde(default = "default_settle_time")]
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,

    /// Streaming rate for arm chunks, Hz.
    #[serde(default = "default_command_rate")]
    pub command_rate: f64,

    /// Per-joint "reached" tolerance, radians.
    #[serde(default = "default_joint_tolerance")]
    pub joint_tolerance: f64,

    /// Per-axis "reached" tolerance, meters.
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,

    /// Whether the background monitor may trigger rewinds.
    #[serde(default)]
    pub auto_rewind_enabled: bool,

    /// Steps replayed by a monitor-triggered rewind.
    #[serde(default = "default_auto_rewind_steps")]
    pub auto_rewind_steps: usize,

    /// Monitor polling interval.
    #[serde(default = "default_monitor_interval")]
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
}

const fn default_chunk_size() -> usize {
    5
}

const fn default_chunk_duration() -> Duration {
    Duration::from_secs(1)
}

const fn default_settle_time() -> Duration {
    Duration::from_millis(500)
}

const fn default_command_rate() -> f64 {
    50.0
}

const fn default_joint_tolerance() -> f64 {
    0.01
}

const fn default_position_tolerance() -> f64 {
    0.005
}

const fn default_auto_rewind_steps() -> usize {
    20
}

const fn default_monitor_interval() -> Duration {
    Duration::from_millis(200)
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_duration: default_chunk_duration(),
            settle_time: default_settle_time(),
            command_rate: default_command_rate(),
            joint_tolerance: default_joint_tolerance(),
            position_tolerance: default_position_tolerance(),
            auto_rewind_enabled: false,
            auto_rewind_steps: default_auto_rewind_steps(),
            monitor_interval: default_monitor_interval(),
        }
    }
}

impl RewindConfig {
    /// Clamp tunables to their supported ranges.
    pub fn sanitize(&mut self) {
        self.chunk_size = self.chunk_size.clamp(1, 50);
        self.chunk_duration = self
            .chunk_duration
            .clamp(Duration::from_millis(100), Duration::from_secs(10));
        if self.command_rate <= 0.0 {
            self.command_rate = default_command_rate();
        }
    }
}

/// How far back to rewind. Every form resolves to a step count over the
/// recorded trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RewindRequest {
    /// Replay the last `n` waypoints.
    Steps(usize),
    /// Replay the given percentage (0..=100) of the trajectory.
    Percentage(f64),
    /// Rewind back to (but not including) the waypoint at this index.
    ToWaypoint(usize),
    /// Rewind back to the last waypoint that passed the safety envelope.
    ToLastSafe,
}

/// Errors from resolving a rewind request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Percentage outside 0..=100 or index past the trajectory end.
    #[error("invalid rewind request: {0}")]
    InvalidRequest(String),

    /// `ToLastSafe` was requested but no recorded waypoint is safe.
    #[error("no safe waypoint recorded")]
    NoSafeWaypoint,
}

impl RewindRequest {
    /// Resolve this request to a number of steps over a trajectory of
    /// `len` waypoints. `last_safe` is the index of the most recent
    /// waypoint inside the envelope, when known.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] for out-of-range percentages or indices,
    /// or when no safe waypoint exists for [`RewindRequest::ToLastSafe`].
    pub fn resolve(self, len: usize, last_safe: Option<usize>) -> Result<usize, ResolveError> {
        match self {
            Self::Steps(n) => Ok(n.min(len)),
            Self::Percentage(p) => {
                if !(0.0..=100.0).contains(&p) {
                    return Err(ResolveError::InvalidRequest(format!(
                        "percentage {p} outside 0..=100"
                    )));
                }
                #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
                #[allow(clippy::cast_possible_truncation)]
                let steps = ((p / 100.0) * len as f64).round() as usize;
                Ok(steps)
            },
            Self::ToWaypoint(idx) => {
                if idx >= len {
                    return Err(ResolveError::InvalidRequest(format!(
                        "waypoint index {idx} past trajectory end {len}"
                    )));
                }
                Ok(len - 1 - idx)
            },
            Self::ToLastSafe => {
                let idx = last_safe.ok_or(ResolveError::NoSafeWaypoint)?;
                if idx >= len {
                    return Err(ResolveError::InvalidRequest(format!(
                        "safe waypoint index {idx} past trajectory end {len}"
                    )));
                }
                Ok(len - 1 - idx)
            },
        }
    }
}

/// A contiguous run of same-kind reversed waypoints executed as one motion.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Waypoints in replay order (reverse chronological).
    pub waypoints: Vec<Waypoint>,
    /// Offset of this chunk's first waypoint within the reversed list.
    pub offset: usize,
}

impl Chunk {
    /// Source-time range `[min, max]` covered by this chunk.
    #[must_use]
    pub fn time_span(&self) -> (f64, f64) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for wp in &self.waypoints {
            min = min.min(wp.t);
            max = max.max(wp.t);
        }
        (min, max)
    }

    /// Whether this chunk's source-time range intersects another's. Used to
    /// decide when an arm chunk and a base chunk should replay concurrently.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (a_min, a_max) = self.time_span();
        let (b_min, b_max) = other.time_span();
        a_min <= b_max && b_min <= a_max
    }

    /// Whether this chunk drives the arm.
    #[must_use]
    pub fn is_arm(&self) -> bool {
        matches!(
            self.waypoints.first().map(|w| &w.kind),
            Some(WaypointKind::ArmJoint(_) | WaypointKind::ArmCartesian(_))
        )
    }

    /// Whether this chunk drives the base.
    #[must_use]
    pub fn is_base(&self) -> bool {
        matches!(
            self.waypoints.first().map(|w| &w.kind),
            Some(WaypointKind::BasePose(_))
        )
    }
}

/// Partition reversed waypoints into chunks of at most `chunk_size`
/// consecutive same-kind entries. Mixed-kind runs are split at the kind
/// boundary.
#[must_use]
pub fn plan_chunks(reversed: &[Waypoint], chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<Waypoint> = Vec::new();
    let mut offset = 0usize;

    for (i, wp) in reversed.iter().enumerate() {
        let split = current.len() >= chunk_size
            || current
                .last()
                .is_some_and(|prev: &Waypoint| !prev.kind.same_stream(&wp.kind));
        if split && !current.is_empty() {
            chunks.push(Chunk {
                waypoints: std::mem::take(&mut current),
                offset,
            });
            offset = i;
        }
        current.push(wp.clone());
    }
    if !current.is_empty() {
        chunks.push(Chunk {
            waypoints: current,
            offset,
        });
    }
    chunks
}

/// Cubic ease-in-out: smooth acceleration and deceleration over `t` in
/// `[0, 1]`.
#[must_use]
pub fn cubic_ease_in_out(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

/// Interpolate between two joint configurations.
#[must_use]
pub fn interpolate_joints(start: &[f64; 7], end: &[f64; 7], alpha: f64) -> [f64; 7] {
    let mut out = [0.0; 7];
    for i in 0..7 {
        out[i] = start[i] + (end[i] - start[i]) * alpha;
    }
    out
}

/// Whether every joint is within tolerance of its target.
#[must_use]
pub fn joints_reached(current: &[f64; 7], target: &[f64; 7], tolerance: f64) -> bool {
    current
        .iter()
        .zip(target.iter())
        .all(|(c, t)| (c - t).abs() <= tolerance)
}

/// Result of a rewind run.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RewindResult {
    /// Whether the full request completed.
    pub success: bool,
    /// Waypoints actually replayed (also the partial count on abort).
    pub steps_rewound: usize,
    /// Index into the recorded trajectory where replay began.
    pub start_index: Option<usize>,
    /// Index of the last waypoint replayed.
    pub end_index: Option<usize>,
    /// Target sequence visited, in replay order. On a dry run this is the
    /// complete preview.
    pub targets: Vec<WaypointKind>,
    /// True when the run ended via `stop()`.
    pub stopped: bool,
    /// Failure reason, if any.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::WaypointSource;

    fn wp(t: f64, kind: WaypointKind) -> Waypoint {
        Waypoint {
            t,
            kind,
            source: WaypointSource::Command,
        }
    }

    fn joint(v: f64) -> WaypointKind {
        WaypointKind::ArmJoint([v, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn base(x: f64) -> WaypointKind {
        WaypointKind::BasePose([x, 0.0, 0.0])
    }

    #[test]
    fn test_resolve_steps_clamped() {
        assert_eq!(RewindRequest::Steps(3).resolve(10, None).unwrap(), 3);
        assert_eq!(RewindRequest::Steps(100).resolve(10, None).unwrap(), 10);
    }

    #[test]
    fn test_resolve_percentage() {
        assert_eq!(
            RewindRequest::Percentage(50.0).resolve(10, None).unwrap(),
            5
        );
        assert_eq!(
            RewindRequest::Percentage(100.0).resolve(7, None).unwrap(),
            7
        );
        assert!(RewindRequest::Percentage(120.0).resolve(10, None).is_err());
    }

    #[test]
    fn test_resolve_to_waypoint() {
        // Rewinding to index 2 of 10 replays waypoints 9..=3.
        assert_eq!(RewindRequest::ToWaypoint(2).resolve(10, None).unwrap(), 7);
        assert!(RewindRequest::ToWaypoint(10).resolve(10, None).is_err());
    }

    #[test]
    fn test_resolve_to_last_safe() {
        assert_eq!(
            RewindRequest::ToLastSafe.resolve(10, Some(6)).unwrap(),
            3
        );
        assert_eq!(
            RewindRequest::ToLastSafe.resolve(10, None),
            Err(ResolveError::NoSafeWaypoint)
        );
    }

    #[test]
    fn test_plan_chunks_splits_on_kind_change() {
        let reversed = vec![
            wp(3.0, joint(3.0)),
            wp(2.0, joint(2.0)),
            wp(1.5, base(1.0)),
            wp(1.0, joint(1.0)),
        ];
        let chunks = plan_chunks(&reversed, 5);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].waypoints.len(), 2);
        assert!(chunks[0].is_arm());
        assert!(chunks[1].is_base());
        assert_eq!(chunks[2].offset, 3);
    }

    #[test]
    fn test_plan_chunks_respects_chunk_size() {
        let reversed: Vec<Waypoint> = (0..7).map(|i| wp(f64::from(i), joint(0.0))).collect();
        let chunks = plan_chunks(&reversed, 3);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.waypoints.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_chunk_overlap_same_instant() {
        // An arm and a base waypoint recorded from the same command time
        // form overlapping single-point chunks.
        let chunks = plan_chunks(&[wp(2.0, joint(0.0)), wp(2.0, base(0.0))], 5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].overlaps(&chunks[1]));
    }

    #[test]
    fn test_chunk_no_overlap_disjoint_times() {
        let chunks = plan_chunks(&[wp(5.0, joint(0.0)), wp(1.0, base(0.0))], 5);
        assert!(!chunks[0].overlaps(&chunks[1]));
    }

    #[test]
    fn test_cubic_ease_endpoints_and_midpoint() {
        assert!((cubic_ease_in_out(0.0)).abs() < 1e-12);
        assert!((cubic_ease_in_out(1.0) - 1.0).abs() < 1e-12);
        assert!((cubic_ease_in_out(0.5) - 0.5).abs() < 1e-12);
        // Monotone.
        let mut prev = 0.0;
        for i in 1..=100 {
            let v = cubic_ease_in_out(f64::from(i) / 100.0);
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn test_joints_reached_tolerance() {
        let target = [0.5; 7];
        let mut current = target;
        current[3] += 0.005;
        assert!(joints_reached(&current, &target, 0.01));
        current[3] += 0.02;
        assert!(!joints_reached(&current, &target, 0.01));
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
