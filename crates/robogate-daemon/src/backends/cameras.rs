//! Camera adapter. Frames are opaque bytes fanned out to WebSocket
//! subscribers; the latest frame is also served over HTTP.
//!
//! Live mode reads length-prefixed JPEG frames from the camera server. In
//! dry-run a generator emits small synthetic frames at the configured rate.

use std::sync::Mutex as StdMutex;

use robogate_core::config::CameraConfig;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ConnectionHealth;

/// JPEG start-of-image marker, so synthetic frames look like frames.
const JPEG_SOI: [u8; 2] = [0xff, 0xd8];

/// Adapter to the camera streams.
pub struct CameraAdapter {
    cfg: CameraConfig,
    dry_run: bool,
    frames: broadcast::Sender<Vec<u8>>,
    latest: StdMutex<Option<Vec<u8>>>,
    health: StdMutex<ConnectionHealth>,
}

impl CameraAdapter {
    /// Create an adapter. Disabled cameras never connect.
    #[must_use]
    pub fn new(cfg: CameraConfig, dry_run: bool) -> Self {
        let (frames, _) = broadcast::channel(8);
        Self {
            cfg,
            dry_run,
            frames,
            latest: StdMutex::new(None),
            health: StdMutex::new(ConnectionHealth::default()),
        }
    }

    /// Whether frames are flowing.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.health.lock().expect("health lock").is_connected()
    }

    /// Connection status for health reporting.
    #[must_use]
    pub fn status(&self) -> robogate_core::state::BackendStatus {
        self.health.lock().expect("health lock").status()
    }

    /// Whether cameras are enabled at all.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// The most recent frame, if any.
    #[must_use]
    pub fn latest_frame(&self) -> Option<Vec<u8>> {
        self.latest.lock().expect("latest lock").clone()
    }

    /// Subscribe to the frame stream. Slow receivers lag and skip frames
    /// rather than buffering unboundedly.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frames.subscribe()
    }

    /// Capture loop. Runs until cancelled; reconnects on stream errors.
    pub async fn run_capture(&self, cancel: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        if self.dry_run {
            self.run_synthetic(cancel).await;
        } else {
            self.run_live(cancel).await;
        }
    }

    async fn run_synthetic(&self, cancel: CancellationToken) {
        self.health.lock().expect("health lock").mark_connected();
        let period = std::time::Duration::from_secs_f64(1.0 / f64::from(self.cfg.fps.max(1)));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut counter: u32 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let mut frame = Vec::with_capacity(8);
            frame.extend_from_slice(&JPEG_SOI);
            frame.extend_from_slice(&counter.to_be_bytes());
            counter = counter.wrapping_add(1);
            self.publish(frame);
        }
        self.health.lock().expect("health lock").mark_disconnected();
    }

    async fn run_live(&self, cancel: CancellationToken) {
        let Some(device) = self.cfg.devices.first().cloned() else {
            warn!("cameras enabled but no devices configured");
            return;
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match TcpStream::connect(&device).await {
                Ok(mut stream) => {
                    debug!(%device, "camera stream connected");
                    self.health.lock().expect("health lock").mark_connected();
                    loop {
                        let frame = tokio::select! {
                            () = cancel.cancelled() => return,
                            frame = read_frame(&mut stream) => frame,
                        };
                        match frame {
                            Ok(frame) => self.publish(frame),
                            Err(e) => {
                                warn!(error = %e, "camera stream lost");
                                self.health
                                    .lock()
                                    .expect("health lock")
                                    .mark_disconnected();
                                break;
                            },
                        }
                    }
                },
                Err(e) => {
                    self.health
                        .lock()
                        .expect("health lock")
                        .mark_error(&super::BackendError::Io(e));
                },
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(std::time::Duration::from_secs(5)) => {},
            }
        }
    }

    fn publish(&self, frame: Vec<u8>) {
        *self.latest.lock().expect("latest lock") = Some(frame.clone());
        self.health.lock().expect("health lock").mark_ok();
        // No subscribers is fine.
        let _ = self.frames.send(frame);
    }
}

/// Read one length-prefixed frame (u32 big-endian length, then bytes).
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_frames_flow() {
        let cfg = CameraConfig {
            enabled: true,
            fps: 100,
            ..CameraConfig::default()
        };
        let cameras = CameraAdapter::new(cfg, true);
        let cancel = CancellationToken::new();
        let mut rx = cameras.subscribe();

        let capture_cancel = cancel.clone();
        let cameras = std::sync::Arc::new(cameras);
        let runner = std::sync::Arc::clone(&cameras);
        let task = tokio::spawn(async move { runner.run_capture(capture_cancel).await });

        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .unwrap();
        assert_eq!(&frame[..2], &JPEG_SOI);
        assert!(cameras.latest_frame().is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_cameras_never_connect() {
        let cameras = CameraAdapter::new(CameraConfig::default(), true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        cameras.run_capture(cancel).await;
        assert!(!cameras.is_connected());
        assert!(cameras.latest_frame().is_none());
    }
}
