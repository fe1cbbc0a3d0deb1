//! Exclusive-access lease coordinator.
//!
//! The lease is a capability: whoever holds the current token may send
//! mutating commands. At most one lease is held at any instant; competing
//! holders wait in a FIFO queue.
//!
//! ```text
//! acquire ──► granted (token minted)
//!    │            │
//!    │ held       ├── extend / command ──► last_activity reset
//!    ▼            │
//! queued ◄────────┤
//!    │            ▼
//!    │   release / idle timeout / TTL expiry / shutdown
//!    │            │
//!    └── promoted◄┘  (queue head granted, FIFO)
//! ```
//!
//! # Key properties
//!
//! - The token never appears in status output, lifecycle events, or logs.
//! - Token comparison is constant-time.
//! - Exactly one revocation path fires per lease; an explicit release wins
//!   over a racing expiry because the revoker re-validates the deadline under
//!   the state lock before acting.
//! - Re-acquiring under the holder's own name returns the same token and
//!   resets the idle timer.
//!
//! Idle revocation is two-phase: when the idle timeout elapses a warning
//! event is emitted, and the lease is revoked only after a further grace
//! period with no activity. A motion probe defers idle revocation while the
//! robot is still physically moving.

mod error;

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

pub use error::LeaseError;

/// Callback consulted before idle revocation; `true` means the robot is
/// still moving and the lease should be kept alive.
pub type MotionProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Lease timing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Hard cap on how long a single lease may be held.
    #[serde(default = "default_ttl")]
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Revocation countdown starts after this much inactivity.
    #[serde(default = "default_idle_timeout")]
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Grace period between the idle warning and the revocation.
    #[serde(default = "default_warning_grace")]
    #[serde(with = "humantime_serde")]
    pub warning_grace: Duration,
}

const fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

const fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_warning_grace() -> Duration {
    Duration::from_secs(10)
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            idle_timeout: default_idle_timeout(),
            warning_grace: default_warning_grace(),
        }
    }
}

/// An unforgeable bearer token identifying the current lease.
#[derive(Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Constant-time comparison against a presented token.
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        let ours = self.0.as_bytes();
        let theirs = presented.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.ct_eq(theirs).into()
    }

    /// The token string, for returning to the holder that minted it. Never
    /// include this in status output or events.
    #[must_use]
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LeaseToken(<redacted>)")
    }
}

/// Why a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    /// No activity past the idle timeout plus grace.
    IdleTimeout,
    /// The hard TTL elapsed.
    TtlExpired,
    /// The gateway is shutting down.
    Shutdown,
}

/// Lease lifecycle events, broadcast to feedback subscribers. Events carry
/// holder names only, never tokens.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseEvent {
    /// A lease was granted.
    LeaseGranted {
        holder: String,
    },
    /// The holder is about to lose the lease to the idle timeout.
    LeaseWarning {
        holder: String,
        seconds_remaining: f64,
    },
    /// The lease was revoked.
    LeaseRevoked {
        holder: String,
        reason: RevokeReason,
    },
    /// The holder released the lease.
    LeaseReleased {
        holder: String,
    },
}

/// Outcome of an acquire call.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The caller now holds (or already held) the lease.
    Granted {
        /// The bearer token. Present it in `X-Lease-Id` on every mutating
        /// request.
        lease_id: String,
    },
    /// The lease is held by someone else; the caller is queued.
    Queued {
        /// Ticket for cancelling the queue entry.
        ticket_id: String,
        /// 1-based queue position.
        position: usize,
    },
}

/// Public view of the lease state. Carries the holder's name and queue
/// positions, never the token.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseStatus {
    /// Current holder name, if a lease is held.
    pub holder: Option<String>,
    /// Seconds until TTL expiry.
    pub remaining_ttl_s: Option<f64>,
    /// Seconds until the idle countdown fires (ignoring the grace period).
    pub remaining_idle_s: Option<f64>,
    /// Number of queued waiters.
    pub queue_length: usize,
    /// Anonymous queue positions.
    pub queue: Vec<QueueSlot>,
}

/// One queue position in [`LeaseStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueSlot {
    /// 1-based position.
    pub position: usize,
    /// Waiter's self-reported name.
    pub holder: String,
}

struct Lease {
    token: LeaseToken,
    holder: String,
    granted_at: Instant,
    last_activity: Instant,
    warned: bool,
}

struct QueueEntry {
    ticket: String,
    holder: String,
}

#[derive(Default)]
struct Inner {
    current: Option<Lease>,
    queue: VecDeque<QueueEntry>,
}

/// Process-wide lease coordinator.
pub struct LeaseCoordinator {
    cfg: LeaseConfig,
    inner: Mutex<Inner>,
    /// Wakes the revoker when deadlines move.
    wake: Notify,
    events: broadcast::Sender<LeaseEvent>,
    motion_probe: RwLock<Option<MotionProbe>>,
}

impl LeaseCoordinator {
    /// Create a coordinator with the given timing configuration.
    #[must_use]
    pub fn new(cfg: LeaseConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            cfg,
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
            events,
            motion_probe: RwLock::new(None),
        }
    }

    /// The timing configuration.
    #[must_use]
    pub const fn config(&self) -> &LeaseConfig {
        &self.cfg
    }

    /// Subscribe to lease lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    /// Install the motion probe consulted before idle revocation.
    pub fn set_motion_probe(&self, probe: MotionProbe) {
        *self.motion_probe.write().expect("motion probe lock") = Some(probe);
    }

    /// Acquire the lease, or join the queue.
    ///
    /// Re-acquiring under the current holder's name is idempotent: it
    /// returns the same token and resets the idle timer, which also lets a
    /// promoted waiter pick up the token minted for it. Re-acquiring while
    /// already queued returns the existing ticket.
    pub async fn acquire(&self, holder: &str) -> AcquireOutcome {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(current) = &mut inner.current {
            if current.holder == holder {
                current.last_activity = Instant::now();
                current.warned = false;
                self.wake.notify_one();
                return AcquireOutcome::Granted {
                    lease_id: current.token.reveal().to_string(),
                };
            }

            if let Some((idx, entry)) = inner
                .queue
                .iter()
                .enumerate()
                .find(|(_, e)| e.holder == holder)
            {
                return AcquireOutcome::Queued {
                    ticket_id: entry.ticket.clone(),
                    position: idx + 1,
                };
            }

            let ticket = Uuid::new_v4().to_string();
            inner.queue.push_back(QueueEntry {
                ticket: ticket.clone(),
                holder: holder.to_string(),
            });
            let position = inner.queue.len();
            info!(holder, position, "lease busy, caller queued");
            return AcquireOutcome::Queued {
                ticket_id: ticket,
                position,
            };
        }

        let lease_id = self.grant(inner, holder.to_string());
        AcquireOutcome::Granted { lease_id }
    }

    /// Release the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NotHolder`] unless the presented token matches
    /// the current lease byte-for-byte.
    pub async fn release(&self, presented: &str) -> Result<(), LeaseError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let matches = inner
            .current
            .as_ref()
            .is_some_and(|c| c.token.matches(presented));
        if !matches {
            return Err(LeaseError::NotHolder);
        }

        let holder = inner.current.take().map(|c| c.holder).unwrap_or_default();
        info!(holder, "lease released");
        self.emit(LeaseEvent::LeaseReleased { holder });
        self.promote_next(inner);
        self.wake.notify_one();
        Ok(())
    }

    /// Reset the idle timer.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NotHolder`] unless the presented token matches.
    pub async fn extend(&self, presented: &str) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        match &mut inner.current {
            Some(current) if current.token.matches(presented) => {
                current.last_activity = Instant::now();
                current.warned = false;
                self.wake.notify_one();
                Ok(())
            },
            _ => Err(LeaseError::NotHolder),
        }
    }

    /// Constant-time check that the presented token is the current one.
    /// Performs no I/O and has no side effects.
    pub async fn authorize(&self, presented: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .current
            .as_ref()
            .is_some_and(|c| c.token.matches(presented))
    }

    /// Record holder activity after an accepted command. Silently ignores
    /// non-matching tokens (the command was already authorized).
    pub async fn touch(&self, presented: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(current) = &mut inner.current {
            if current.token.matches(presented) {
                current.last_activity = Instant::now();
                current.warned = false;
                self.wake.notify_one();
            }
        }
    }

    /// Cancel a queue entry.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::UnknownTicket`] if no entry has this ticket.
    pub async fn cancel(&self, ticket: &str) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.queue.len();
        inner.queue.retain(|e| e.ticket != ticket);
        if inner.queue.len() == before {
            return Err(LeaseError::UnknownTicket(ticket.to_string()));
        }
        Ok(())
    }

    /// Public status view. Never contains the token.
    pub async fn status(&self) -> LeaseStatus {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let (holder, remaining_ttl_s, remaining_idle_s) = match &inner.current {
            Some(c) => {
                let ttl_left = (c.granted_at + self.cfg.ttl).saturating_duration_since(now);
                let idle_left =
                    (c.last_activity + self.cfg.idle_timeout).saturating_duration_since(now);
                (
                    Some(c.holder.clone()),
                    Some(ttl_left.as_secs_f64()),
                    Some(idle_left.as_secs_f64()),
                )
            },
            None => (None, None, None),
        };
        LeaseStatus {
            holder,
            remaining_ttl_s,
            remaining_idle_s,
            queue_length: inner.queue.len(),
            queue: inner
                .queue
                .iter()
                .enumerate()
                .map(|(i, e)| QueueSlot {
                    position: i + 1,
                    holder: e.holder.clone(),
                })
                .collect(),
        }
    }

    /// Revoke any held lease and clear the queue. Used on gateway shutdown.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.current.take() {
            self.emit(LeaseEvent::LeaseRevoked {
                holder: current.holder,
                reason: RevokeReason::Shutdown,
            });
        }
        inner.queue.clear();
        self.wake.notify_one();
    }

    /// Background revocation loop. Wakes at the earliest of the TTL and
    /// idle deadlines, re-validates under the lock, and revokes when the
    /// deadline arrived unchanged. Runs until the owning task is dropped.
    pub async fn run_revoker(&self) {
        loop {
            let deadline = {
                let inner = self.inner.lock().await;
                inner.current.as_ref().map(|c| self.next_deadline(c))
            };

            match deadline {
                None => self.wake.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => self.on_deadline().await,
                        () = self.wake.notified() => {},
                    }
                },
            }
        }
    }

    // -- internals -----------------------------------------------------------

    fn next_deadline(&self, lease: &Lease) -> Instant {
        let ttl_deadline = lease.granted_at + self.cfg.ttl;
        let idle_deadline = if lease.warned {
            lease.last_activity + self.cfg.idle_timeout + self.cfg.warning_grace
        } else {
            lease.last_activity + self.cfg.idle_timeout
        };
        ttl_deadline.min(idle_deadline)
    }

    async fn on_deadline(&self) {
        enum Due {
            Ttl,
            Idle { warned: bool },
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let now = Instant::now();

        // Re-validate: the lease may have been released, extended, or
        // replaced while we slept. `next_deadline` over the live state
        // decides whether anything is actually due.
        let due = match &inner.current {
            None => return,
            Some(current) => {
                if now < self.next_deadline(current) {
                    return;
                }
                if now >= current.granted_at + self.cfg.ttl {
                    Due::Ttl
                } else {
                    Due::Idle {
                        warned: current.warned,
                    }
                }
            },
        };

        match due {
            Due::Ttl => self.revoke(inner, RevokeReason::TtlExpired),
            Due::Idle { warned } => {
                let moving = self
                    .motion_probe
                    .read()
                    .expect("motion probe lock")
                    .as_ref()
                    .is_some_and(|probe| probe());

                if !moving && warned {
                    self.revoke(inner, RevokeReason::IdleTimeout);
                    return;
                }

                let Some(current) = &mut inner.current else {
                    return;
                };
                if moving {
                    // Physical motion counts as activity.
                    current.last_activity = now;
                    current.warned = false;
                } else {
                    current.warned = true;
                    let holder = current.holder.clone();
                    self.emit(LeaseEvent::LeaseWarning {
                        holder,
                        seconds_remaining: self.cfg.warning_grace.as_secs_f64(),
                    });
                }
            },
        }
    }

    fn grant(&self, inner: &mut Inner, holder: String) -> String {
        let token = LeaseToken::mint();
        let lease_id = token.reveal().to_string();
        let now = Instant::now();
        info!(holder, "lease granted");
        self.emit(LeaseEvent::LeaseGranted {
            holder: holder.clone(),
        });
        inner.current = Some(Lease {
            token,
            holder,
            granted_at: now,
            last_activity: now,
            warned: false,
        });
        self.wake.notify_one();
        lease_id
    }

    fn promote_next(&self, inner: &mut Inner) {
        if let Some(entry) = inner.queue.pop_front() {
            self.grant(inner, entry.holder);
        }
    }

    fn revoke(&self, inner: &mut Inner, reason: RevokeReason) {
        if let Some(current) = inner.current.take() {
            info!(holder = current.holder, ?reason, "lease revoked");
            self.emit(LeaseEvent::LeaseRevoked {
                holder: current.holder,
                reason,
            });
            self.promote_next(inner);
        }
    }

    fn emit(&self, event: LeaseEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<LeaseCoordinator> {
        Arc::new(LeaseCoordinator::new(LeaseConfig {
            ttl: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(30),
            warning_grace: Duration::from_secs(10),
        }))
    }

    fn granted_id(outcome: &AcquireOutcome) -> String {
        match outcome {
            AcquireOutcome::Granted { lease_id } => lease_id.clone(),
            AcquireOutcome::Queued { .. } => panic!("expected grant"),
        }
    }

    #[tokio::test]
    async fn test_acquire_release_extend() {
        let lease = coordinator();
        let id = granted_id(&lease.acquire("a").await);

        assert!(lease.authorize(&id).await);
        lease.extend(&id).await.unwrap();
        lease.release(&id).await.unwrap();

        assert!(!lease.authorize(&id).await);
        assert_eq!(lease.extend(&id).await, Err(LeaseError::NotHolder));
    }

    #[tokio::test]
    async fn test_at_most_one_holder() {
        let lease = coordinator();
        let id_a = granted_id(&lease.acquire("a").await);

        match lease.acquire("b").await {
            AcquireOutcome::Queued { position, .. } => assert_eq!(position, 1),
            AcquireOutcome::Granted { .. } => panic!("second acquire must queue"),
        }

        // Only the current token authorizes.
        assert!(lease.authorize(&id_a).await);
        assert!(!lease.authorize("not-the-token").await);
    }

    #[tokio::test]
    async fn test_reacquire_is_idempotent() {
        let lease = coordinator();
        let first = granted_id(&lease.acquire("a").await);
        let second = granted_id(&lease.acquire("a").await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_queue_fifo_promotion() {
        let lease = coordinator();
        let id_a = granted_id(&lease.acquire("a").await);
        lease.acquire("b").await;
        lease.acquire("c").await;

        lease.release(&id_a).await.unwrap();

        let status = lease.status().await;
        assert_eq!(status.holder.as_deref(), Some("b"));
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.queue[0].holder, "c");

        // b recovers its token via idempotent re-acquire.
        let id_b = granted_id(&lease.acquire("b").await);
        assert!(lease.authorize(&id_b).await);
    }

    #[tokio::test]
    async fn test_cancel_queue_entry() {
        let lease = coordinator();
        let id_a = granted_id(&lease.acquire("a").await);
        let ticket = match lease.acquire("b").await {
            AcquireOutcome::Queued { ticket_id, .. } => ticket_id,
            AcquireOutcome::Granted { .. } => panic!("expected queue"),
        };

        lease.cancel(&ticket).await.unwrap();
        assert_eq!(lease.status().await.queue_length, 0);
        assert!(matches!(
            lease.cancel(&ticket).await,
            Err(LeaseError::UnknownTicket(_))
        ));

        lease.release(&id_a).await.unwrap();
        assert!(lease.status().await.holder.is_none());
    }

    #[tokio::test]
    async fn test_status_never_reveals_token() {
        let lease = coordinator();
        let id = granted_id(&lease.acquire("alice").await);

        let status = lease.status().await;
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains(&id));
        assert!(json.contains("alice"));
    }

    #[tokio::test]
    async fn test_release_requires_exact_token() {
        let lease = coordinator();
        granted_id(&lease.acquire("a").await);
        assert_eq!(
            lease.release("wrong-token").await,
            Err(LeaseError::NotHolder)
        );
        assert!(lease.status().await.holder.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_warning_then_revocation() {
        let lease = coordinator();
        let revoker = Arc::clone(&lease);
        let task = tokio::spawn(async move { revoker.run_revoker().await });
        let mut events = lease.subscribe();

        granted_id(&lease.acquire("a").await);

        // Past the idle timeout: warning fires.
        tokio::time::sleep(Duration::from_secs(31)).await;
        loop {
            match events.recv().await.unwrap() {
                LeaseEvent::LeaseWarning { holder, .. } => {
                    assert_eq!(holder, "a");
                    break;
                },
                LeaseEvent::LeaseGranted { .. } => {},
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // Past the grace period: revocation fires and a new holder may
        // acquire.
        tokio::time::sleep(Duration::from_secs(11)).await;
        loop {
            match events.recv().await.unwrap() {
                LeaseEvent::LeaseRevoked { reason, .. } => {
                    assert_eq!(reason, RevokeReason::IdleTimeout);
                    break;
                },
                other => panic!("unexpected event: {other:?}"),
            }
        }

        match lease.acquire("b").await {
            AcquireOutcome::Granted { .. } => {},
            AcquireOutcome::Queued { .. } => panic!("lease should be free after revocation"),
        }

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_defers_idle_revocation() {
        let lease = coordinator();
        let revoker = Arc::clone(&lease);
        let task = tokio::spawn(async move { revoker.run_revoker().await });

        let id = granted_id(&lease.acquire("a").await);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            lease.extend(&id).await.unwrap();
        }

        assert!(lease.authorize(&id).await);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_revocation_fires_even_when_active() {
        let lease = coordinator();
        let revoker = Arc::clone(&lease);
        let task = tokio::spawn(async move { revoker.run_revoker().await });

        let id = granted_id(&lease.acquire("a").await);

        // Keep extending; the TTL must still win.
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(11)).await;
            let _ = lease.extend(&id).await;
        }

        assert!(!lease.authorize(&id).await);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_probe_defers_idle() {
        let lease = coordinator();
        lease.set_motion_probe(Arc::new(|| true));
        let revoker = Arc::clone(&lease);
        let task = tokio::spawn(async move { revoker.run_revoker().await });

        let id = granted_id(&lease.acquire("a").await);
        tokio::time::sleep(Duration::from_secs(120)).await;

        // Motors "moving" the whole time: no idle revocation.
        assert!(lease.authorize(&id).await);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wins_over_pending_expiry() {
        let lease = coordinator();
        let revoker = Arc::clone(&lease);
        let task = tokio::spawn(async move { revoker.run_revoker().await });
        let mut events = lease.subscribe();

        let id = granted_id(&lease.acquire("a").await);
        lease.release(&id).await.unwrap();

        // Drive time far past every deadline; the revoker must not emit a
        // revocation for the already-released lease.
        tokio::time::sleep(Duration::from_secs(600)).await;

        let mut revocations = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LeaseEvent::LeaseRevoked { .. }) {
                revocations += 1;
            }
        }
        assert_eq!(revocations, 0);
        task.abort();
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = LeaseToken::mint();
        let debug = format!("{token:?}");
        assert!(!debug.contains(token.reveal()));
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
