//! State aggregator.
//!
//! One polling task per backend at its own rate writes into per-subsystem
//! slots; a publisher composes the latest slots into an immutable
//! [`Snapshot`] and sends it over a `watch` channel. `watch` keeps only the
//! newest value, which gives every subscriber conflation for free: a slow
//! WebSocket sender sees the latest snapshot, never a queue of stale ones.
//!
//! Disconnected backends keep their last known value with `stale = true`,
//! and a reconnect is attempted every [`RECONNECT_INTERVAL`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use robogate_core::state::{ArmState, BaseState, GripperState, Snapshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backends::{ArmAdapter, BaseAdapter, CameraAdapter, GripperAdapter};

/// How often to attempt reconnection to disconnected backends.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// A slot goes stale when its poll has not succeeded for this long.
const STALE_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Slot<T> {
    value: T,
    last_ok: Option<std::time::Instant>,
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            last_ok: None,
        }
    }
}

impl<T: Clone> Slot<T> {
    fn update(&mut self, value: T) {
        self.value = value;
        self.last_ok = Some(std::time::Instant::now());
    }

    fn stale(&self) -> bool {
        self.last_ok.map_or(true, |t| t.elapsed() > STALE_AFTER)
    }
}

#[derive(Debug, Default)]
struct Slots {
    arm: Slot<ArmState>,
    base: Slot<BaseState>,
    gripper: Slot<GripperState>,
}

/// Polls the adapters and publishes composed snapshots.
pub struct StateAggregator {
    arm: Arc<ArmAdapter>,
    base: Arc<BaseAdapter>,
    gripper: Arc<GripperAdapter>,
    cameras: Arc<CameraAdapter>,
    slots: StdMutex<Slots>,
    snapshot_tx: tokio::sync::watch::Sender<Arc<Snapshot>>,
    seq: AtomicU64,
    last_published: StdMutex<DateTime<Utc>>,
    arm_poll: Duration,
    base_poll: Duration,
    gripper_poll: Duration,
    publish_period: Duration,
}

impl StateAggregator {
    /// Create an aggregator over the four adapters.
    #[must_use]
    pub fn new(
        arm: Arc<ArmAdapter>,
        base: Arc<BaseAdapter>,
        gripper: Arc<GripperAdapter>,
        cameras: Arc<CameraAdapter>,
        arm_poll_hz: f64,
        base_poll_hz: f64,
        gripper_poll_hz: f64,
        publish_hz: f64,
    ) -> Self {
        let (snapshot_tx, _) = tokio::sync::watch::channel(Arc::new(Snapshot::default()));
        Self {
            arm,
            base,
            gripper,
            cameras,
            slots: StdMutex::new(Slots::default()),
            snapshot_tx,
            seq: AtomicU64::new(0),
            last_published: StdMutex::new(Utc::now()),
            arm_poll: period(arm_poll_hz),
            base_poll: period(base_poll_hz),
            gripper_poll: period(gripper_poll_hz),
            publish_period: period(publish_hz),
        }
    }

    /// Subscribe to published snapshots.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// The most recently published snapshot.
    #[must_use]
    pub fn latest(&self) -> Arc<Snapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Whether any motor is in significant motion, per the latest snapshot.
    #[must_use]
    pub fn motors_moving(&self) -> bool {
        self.latest().motors_moving
    }

    /// Run pollers and the publisher until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tasks = Vec::new();

        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                this.poll_loop(cancel, PollTarget::Arm).await;
            }));
        }
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                this.poll_loop(cancel, PollTarget::Base).await;
            }));
        }
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                this.poll_loop(cancel, PollTarget::Gripper).await;
            }));
        }
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                this.publish_loop(cancel).await;
            }));
        }

        cancel.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn poll_loop(&self, cancel: CancellationToken, target: PollTarget) {
        let poll_period = match target {
            PollTarget::Arm => self.arm_poll,
            PollTarget::Base => self.base_poll,
            PollTarget::Gripper => self.gripper_poll,
        };
        let mut ticker = tokio::time::interval(poll_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_reconnect: Option<std::time::Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            let connected = match target {
                PollTarget::Arm => self.arm.is_connected(),
                PollTarget::Base => self.base.is_connected(),
                PollTarget::Gripper => self.gripper.is_connected(),
            };

            if !connected {
                let due = last_reconnect.map_or(true, |t| t.elapsed() >= RECONNECT_INTERVAL);
                if due {
                    last_reconnect = Some(std::time::Instant::now());
                    let result = match target {
                        PollTarget::Arm => self.arm.connect().await,
                        PollTarget::Base => self.base.connect().await,
                        PollTarget::Gripper => self.gripper.connect().await,
                    };
                    match result {
                        Ok(()) => debug!(?target, "backend reconnected"),
                        Err(e) => debug!(?target, error = %e, "reconnect failed"),
                    }
                }
                continue;
            }

            match target {
                PollTarget::Arm => {
                    if let Ok(state) = self.arm.get_state().await {
                        self.slots.lock().expect("slots lock").arm.update(state);
                    }
                },
                PollTarget::Base => {
                    if let Ok(state) = self.base.get_state().await {
                        self.slots.lock().expect("slots lock").base.update(state);
                    }
                },
                PollTarget::Gripper => {
                    if let Ok(state) = self.gripper.get_state().await {
                        self.slots
                            .lock()
                            .expect("slots lock")
                            .gripper
                            .update(state);
                    }
                },
            }
        }
    }

    async fn publish_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.publish_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            self.publish_now();
        }
    }

    /// Poll every backend once and fold the results into the slots. Lets
    /// one-shot callers refresh without the background loops.
    pub async fn poll_once(&self) {
        if let Ok(state) = self.arm.get_state().await {
            self.slots.lock().expect("slots lock").arm.update(state);
        }
        if let Ok(state) = self.base.get_state().await {
            self.slots.lock().expect("slots lock").base.update(state);
        }
        if let Ok(state) = self.gripper.get_state().await {
            self.slots
                .lock()
                .expect("slots lock")
                .gripper
                .update(state);
        }
    }

    /// Compose and publish one snapshot immediately. Exposed so tests can
    /// drive the aggregator without the background loops.
    pub fn publish_now(&self) {
        let mut snapshot = {
            let slots = self.slots.lock().expect("slots lock");
            let mut snapshot = Snapshot {
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                timestamp: Utc::now(),
                arm: robogate_core::state::Stamped {
                    state: slots.arm.value.clone(),
                    stale: slots.arm.stale() || !self.arm.is_connected(),
                },
                base: robogate_core::state::Stamped {
                    state: slots.base.value.clone(),
                    stale: slots.base.stale() || !self.base.is_connected(),
                },
                gripper: robogate_core::state::Stamped {
                    state: slots.gripper.value.clone(),
                    stale: slots.gripper.stale() || !self.gripper.is_connected(),
                },
                backends: robogate_core::state::BackendStatuses {
                    arm: self.arm.status(),
                    base: self.base.status(),
                    gripper: self.gripper.status(),
                    cameras: self.cameras.status(),
                },
                motors_moving: false,
            };
            snapshot.motors_moving = snapshot.compute_motors_moving();
            snapshot
        };

        // Timestamps must never run backwards for subscribers, even across
        // wall-clock adjustments.
        {
            let mut last = self.last_published.lock().expect("timestamp lock");
            if snapshot.timestamp < *last {
                snapshot.timestamp = *last;
            }
            *last = snapshot.timestamp;
        }

        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

#[derive(Debug, Clone, Copy)]
enum PollTarget {
    Arm,
    Base,
    Gripper,
}

fn period(hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / hz.max(0.1))
}
