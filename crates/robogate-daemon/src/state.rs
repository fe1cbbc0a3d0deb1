//! Gateway wiring.
//!
//! [`Gateway`] is the explicit dependency-injection record handed to every
//! handler: adapters, aggregator, lease coordinator, recorder, safety
//! envelope, rewind engine, executor, service runtime, and the feedback
//! hub. Tests build the whole gateway in dry-run mode with simulated
//! adapters and drive it through the same structs the HTTP surface uses.

use std::sync::{Arc, Mutex as StdMutex};

use robogate_core::config::GatewayConfig;
use robogate_core::lease::LeaseCoordinator;
use robogate_core::safety::SafetyEnvelope;
use robogate_core::trajectory::TrajectoryRecorder;
use robogate_core::GatewayError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregator::StateAggregator;
use crate::backends::{ArmAdapter, BaseAdapter, CameraAdapter, GripperAdapter};
use crate::executor::CodeExecutor;
use crate::feedback::FeedbackHub;
use crate::monitor::AutoRewindMonitor;
use crate::rewind::RewindEngine;
use crate::services::ServiceRuntime;

/// Process-wide gateway state.
pub struct Gateway {
    pub config: GatewayConfig,
    pub arm: Arc<ArmAdapter>,
    pub base: Arc<BaseAdapter>,
    pub gripper: Arc<GripperAdapter>,
    pub cameras: Arc<CameraAdapter>,
    pub aggregator: Arc<StateAggregator>,
    pub lease: Arc<LeaseCoordinator>,
    pub recorder: Arc<StdMutex<TrajectoryRecorder>>,
    pub safety: SafetyEnvelope,
    pub rewind: Arc<RewindEngine>,
    pub executor: Arc<CodeExecutor>,
    pub monitor: Arc<AutoRewindMonitor>,
    pub services: Option<Arc<ServiceRuntime>>,
    pub feedback: FeedbackHub,
    /// Root cancellation token for every background task and WS session.
    pub cancel: CancellationToken,
}

impl Gateway {
    /// Build the gateway from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the service definitions are invalid (duplicate
    /// keys, unknown dependencies, cycles).
    pub fn new(config: GatewayConfig, enable_services: bool) -> Result<Arc<Self>, GatewayError> {
        let dry_run = config.server.dry_run;

        let arm = Arc::new(ArmAdapter::new(config.arm.clone(), dry_run));
        let base = Arc::new(BaseAdapter::new(config.base.clone(), dry_run));
        let gripper = Arc::new(GripperAdapter::new(config.gripper.clone(), dry_run));
        let cameras = Arc::new(CameraAdapter::new(config.cameras.clone(), dry_run));

        let aggregator = Arc::new(StateAggregator::new(
            Arc::clone(&arm),
            Arc::clone(&base),
            Arc::clone(&gripper),
            Arc::clone(&cameras),
            config.arm.poll_hz,
            config.base.poll_hz,
            config.gripper.poll_hz,
            config.server.publish_hz,
        ));

        let lease = Arc::new(LeaseCoordinator::new(config.lease.clone()));
        {
            let probe_aggregator = Arc::clone(&aggregator);
            lease.set_motion_probe(Arc::new(move || probe_aggregator.motors_moving()));
        }

        let recorder = Arc::new(StdMutex::new(TrajectoryRecorder::new(
            config.server.max_trajectory_length,
        )));
        let safety = SafetyEnvelope::new(config.safety.clone());

        let rewind = Arc::new(RewindEngine::new(
            Arc::clone(&arm),
            Arc::clone(&base),
            Arc::clone(&gripper),
            Arc::clone(&recorder),
            safety.clone(),
            config.rewind.clone(),
        ));

        let server_url = format!("http://127.0.0.1:{}", config.server.port);
        let executor = Arc::new(CodeExecutor::new(
            config.executor.clone(),
            server_url,
            Arc::clone(&arm),
            Arc::clone(&base),
        ));

        let monitor = Arc::new(AutoRewindMonitor::new(
            Arc::clone(&rewind),
            Arc::clone(&aggregator),
            Arc::clone(&base),
            safety.clone(),
        ));

        let feedback = FeedbackHub::new();
        let services = if enable_services && config.services.enabled {
            Some(Arc::new(
                ServiceRuntime::new(config.services.clone(), dry_run, feedback.clone())
                    .map_err(GatewayError::from)?,
            ))
        } else {
            None
        };

        Ok(Arc::new(Self {
            config,
            arm,
            base,
            gripper,
            cameras,
            aggregator,
            lease,
            recorder,
            safety,
            rewind,
            executor,
            monitor,
            services,
            feedback,
            cancel: CancellationToken::new(),
        }))
    }

    /// A dry-run gateway with the service manager in dry-run mode. Used by
    /// tests and `--dry-run`.
    ///
    /// # Errors
    ///
    /// Propagates definition validation failures.
    pub fn dry_run(mut config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        config.server.dry_run = true;
        Self::new(config, true)
    }

    /// Connect every backend. Failures are logged, not fatal; the
    /// aggregator keeps retrying in the background.
    pub async fn connect_backends(&self) {
        if let Err(e) = self.base.connect().await {
            error!(error = %e, "base backend connect failed");
        }
        if let Err(e) = self.arm.connect().await {
            error!(error = %e, "arm backend connect failed");
        }
        if let Err(e) = self.gripper.connect().await {
            error!(error = %e, "gripper backend connect failed");
        }
    }

    /// Spawn the long-lived background tasks: the arm streamer, pollers and
    /// publisher, camera capture, lease revoker, lease event forwarding,
    /// the auto-rewind monitor, and the service health loop.
    pub async fn start_background(&self) {
        let cancel = self.cancel.clone();

        {
            let arm = Arc::clone(&self.arm);
            let cancel = cancel.clone();
            tokio::spawn(async move { arm.run_streamer(cancel).await });
        }
        {
            let aggregator = Arc::clone(&self.aggregator);
            let cancel = cancel.clone();
            tokio::spawn(async move { aggregator.run(cancel).await });
        }
        {
            let cameras = Arc::clone(&self.cameras);
            let cancel = cancel.clone();
            tokio::spawn(async move { cameras.run_capture(cancel).await });
        }
        {
            let lease = Arc::clone(&self.lease);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {},
                    () = lease.run_revoker() => {},
                }
            });
        }
        {
            // Lease lifecycle events feed the feedback stream.
            let mut events = self.lease.subscribe();
            let feedback = self.feedback.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(event) => {
                                if let Ok(value) = serde_json::to_value(&event) {
                                    feedback.send(value);
                                }
                            },
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }
        {
            let monitor = Arc::clone(&self.monitor);
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await });
        }

        if let Some(services) = &self.services {
            services.adopt_or_cleanup().await;
            let runtime = Arc::clone(services);
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run_health_loop(cancel).await });
        }
    }

    /// Auto-start supervised services when configured.
    pub async fn auto_start_services(&self) {
        if let Some(services) = &self.services {
            services.auto_start().await;
        }
    }

    /// Ordered shutdown: revoke the lease, cancel any rewind, stop code
    /// execution, cancel background tasks and WS sessions, disconnect
    /// adapters, then stop supervised services in reverse dependency order.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");

        self.lease.shutdown().await;
        self.rewind.stop();
        self.executor.stop().await;
        self.cancel.cancel();

        self.arm.close().await;
        self.base.close().await;
        self.gripper.close().await;

        if let Some(services) = &self.services {
            services.shutdown().await;
        }
        info!("gateway shutdown complete");
    }
}
