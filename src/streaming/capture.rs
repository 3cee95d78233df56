//! Capture loop: the single producer feeding the frame distributor
//!
//! One `CaptureLoop` owns one device. It runs on a blocking thread,
//! repeatedly opening a session, negotiating Motion-JPEG, and publishing
//! every non-empty frame. A session that faults is closed and, subject to
//! the restart policy, reopened after an exponential backoff.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::frame::Frame;
use super::frame_distributor::FrameDistributor;
use crate::camera::{CameraDriver, DeviceClaim, DeviceError, FrameSource};
use crate::config::Config;

/// Log distributor stats every this many frames
const STATS_EVERY_FRAMES: u64 = 300;

/// Consecutive timeouts between warn-level log lines
const TIMEOUT_WARN_EVERY: u64 = 10;

/// Granularity of the stop check while backing off
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device {0} is already owned by another capture loop")]
    DeviceClaimed(String),

    #[error("capture gave up after {attempts} failed sessions: {last}")]
    RestartsExhausted {
        attempts: u32,
        #[source]
        last: DeviceError,
    },

    #[error("capture task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Opening,
    Streaming,
    /// Stopped on request
    Closed,
    /// Last session ended on a device error
    Faulted,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device_path: String,
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub frame_timeout: Duration,
    /// Consecutive failed sessions tolerated; 0 stops at the first fault
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl CaptureSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_path: config.camera.device_path.clone(),
            pixel_format: config.camera.pixel_format.clone(),
            width: config.camera.width,
            height: config.camera.height,
            frame_timeout: config.camera.frame_timeout(),
            max_restarts: config.capture.max_restarts,
            initial_backoff: config.capture.initial_backoff(),
            max_backoff: config.capture.max_backoff(),
        }
    }
}

/// Statistics for capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub empty_frames: u64,
    pub timeouts: u64,
    pub sessions: u64,
    pub faults: u64,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    empty_frames: AtomicU64,
    timeouts: AtomicU64,
    sessions: AtomicU64,
    faults: AtomicU64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            empty_frames: self.empty_frames.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Observes and stops a capture loop from other tasks.
#[derive(Debug, Clone)]
pub struct CaptureMonitor {
    state_rx: watch::Receiver<CaptureState>,
    counters: Arc<CaptureCounters>,
    stop: Arc<AtomicBool>,
}

impl CaptureMonitor {
    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    /// Receiver that is notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Ask the loop to stop. It notices within one frame timeout.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// How a single device session ended
enum SessionEnd {
    Stopped,
    Faulted { error: DeviceError, delivered: u64 },
}

pub struct CaptureLoop {
    settings: CaptureSettings,
    driver: Arc<dyn CameraDriver>,
    distributor: Arc<FrameDistributor>,
    state_tx: watch::Sender<CaptureState>,
    counters: Arc<CaptureCounters>,
    stop: Arc<AtomicBool>,
    next_sequence: u64,
    claim: DeviceClaim,
}

impl CaptureLoop {
    /// Claim the configured device for a new capture loop.
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        distributor: Arc<FrameDistributor>,
        settings: CaptureSettings,
    ) -> Result<Self, CaptureError> {
        let claim = DeviceClaim::acquire(&settings.device_path)
            .ok_or_else(|| CaptureError::DeviceClaimed(settings.device_path.clone()))?;
        let (state_tx, _) = watch::channel(CaptureState::Idle);

        Ok(Self {
            settings,
            driver,
            distributor,
            state_tx,
            counters: Arc::new(CaptureCounters::default()),
            stop: Arc::new(AtomicBool::new(false)),
            next_sequence: 0,
            claim,
        })
    }

    pub fn monitor(&self) -> CaptureMonitor {
        CaptureMonitor {
            state_rx: self.state_tx.subscribe(),
            counters: Arc::clone(&self.counters),
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run on tokio's blocking pool.
    pub fn spawn(self) -> JoinHandle<Result<(), CaptureError>> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Run until stopped or until the restart policy gives up.
    ///
    /// Closes the distributor on the way out, so subscribers see the end
    /// of the stream instead of waiting forever.
    pub fn run(mut self) -> Result<(), CaptureError> {
        info!(
            device = %self.claim.path(),
            format = %self.settings.pixel_format,
            resolution = %format!("{}x{}", self.settings.width, self.settings.height),
            "Capture loop starting"
        );

        let result = self.supervise();

        // Close before publishing the terminal state
        self.distributor.close();
        self.set_state(if result.is_ok() {
            CaptureState::Closed
        } else {
            CaptureState::Faulted
        });

        let stats = self.counters.snapshot();
        info!(
            device = %self.claim.path(),
            frames = stats.frames_captured,
            sessions = stats.sessions,
            faults = stats.faults,
            "Capture loop finished"
        );

        result
    }

    fn supervise(&mut self) -> Result<(), CaptureError> {
        let mut failures: u32 = 0;
        let mut backoff = self.settings.initial_backoff;

        loop {
            let (error, delivered) = match self.run_session() {
                SessionEnd::Stopped => return Ok(()),
                SessionEnd::Faulted { error, delivered } => (error, delivered),
            };

            self.counters.faults.fetch_add(1, Ordering::Relaxed);

            if delivered > 0 {
                failures = 0;
                backoff = self.settings.initial_backoff;
            }
            failures += 1;

            if failures > self.settings.max_restarts {
                error!(
                    device = %self.settings.device_path,
                    error = %error,
                    attempts = failures,
                    "Camera session failed, giving up"
                );
                return Err(CaptureError::RestartsExhausted {
                    attempts: failures,
                    last: error,
                });
            }

            self.set_state(CaptureState::Faulted);
            error!(
                device = %self.settings.device_path,
                error = %error,
                retry_in_ms = backoff.as_millis() as u64,
                attempt = failures,
                max_restarts = self.settings.max_restarts,
                "Camera session failed, restarting"
            );

            if !self.sleep_unless_stopped(backoff) {
                return Ok(());
            }
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }

    fn run_session(&mut self) -> SessionEnd {
        if self.stopped() {
            return SessionEnd::Stopped;
        }

        self.set_state(CaptureState::Opening);
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);

        let mut source = match self.driver.open(&self.settings.device_path) {
            Ok(source) => source,
            Err(error) => return SessionEnd::Faulted { error, delivered: 0 },
        };

        let mut delivered = 0;
        let result = self.stream_from(source.as_mut(), &mut delivered);
        source.close();

        match result {
            Ok(()) => SessionEnd::Stopped,
            Err(error) => SessionEnd::Faulted { error, delivered },
        }
    }

    /// Pull frames until stopped (`Ok`) or the device fails (`Err`).
    fn stream_from(
        &mut self,
        source: &mut dyn FrameSource,
        delivered: &mut u64,
    ) -> Result<(), DeviceError> {
        let s = &self.settings;
        source.negotiate_format(&s.pixel_format, s.width, s.height)?;
        source.start_streaming()?;

        self.set_state(CaptureState::Streaming);
        info!(device = %self.settings.device_path, "Camera streaming");

        let timeout = self.settings.frame_timeout;
        let mut consecutive_timeouts: u64 = 0;

        while !self.stopped() {
            match source.wait_frame(timeout) {
                Ok(()) => consecutive_timeouts = 0,
                Err(e) if e.is_timeout() => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    consecutive_timeouts += 1;
                    if consecutive_timeouts % TIMEOUT_WARN_EVERY == 0 {
                        warn!(
                            device = %self.settings.device_path,
                            consecutive = consecutive_timeouts,
                            "No frame from camera"
                        );
                    } else {
                        debug!(device = %self.settings.device_path, error = %e, "Frame wait timed out");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }

            let payload = source.read_frame()?;
            if payload.is_empty() {
                self.counters.empty_frames.fetch_add(1, Ordering::Relaxed);
                debug!(device = %self.settings.device_path, "Empty frame skipped");
                continue;
            }

            let frame = Frame::new(self.next_sequence, payload);
            self.next_sequence += 1;
            *delivered += 1;

            let captured = self.counters.frames_captured.fetch_add(1, Ordering::Relaxed) + 1;
            let viewers = self.distributor.publish(frame);
            debug!(sequence = self.next_sequence - 1, viewers, "Frame published");

            if captured % STATS_EVERY_FRAMES == 0 {
                self.distributor.log_stats();
            }
        }

        Ok(())
    }

    /// Sleep in short slices; false if a stop was requested meanwhile.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.stopped() {
                return false;
            }
            let slice = remaining.min(BACKOFF_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
        !self.stopped()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: CaptureState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Capture state changed");
        }
    }
}
