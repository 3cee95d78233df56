//! Camera device abstraction
//!
//! The capture pipeline only ever talks to a camera through the
//! [`CameraDriver`] / [`FrameSource`] pair, so the V4L2 backend in
//! [`v4l2`] can be swapped for a scripted source in tests.

pub mod v4l2;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub use v4l2::V4l2Driver;

/// Pixel format description the streaming pipeline negotiates.
pub const MJPEG_FORMAT_NAME: &str = "Motion-JPEG";

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot open camera {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("camera {path} is busy")]
    Busy { path: String },

    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),

    #[error("cannot start streaming: {0}")]
    Stream(#[source] std::io::Error),

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("frame read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("cannot enumerate formats: {0}")]
    Enumerate(#[source] std::io::Error),

    #[error("camera is not streaming")]
    NotStreaming,
}

impl DeviceError {
    /// Timeouts mean "no frame yet"; everything else ends the session.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Timeout(_))
    }
}

/// A width x height pair. Ordered by width, then height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One frame-size entry as reported by the driver.
///
/// Discrete sizes report the same value for both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizeRange {
    pub min: Resolution,
    pub max: Resolution,
}

impl FrameSizeRange {
    pub const fn discrete(width: u32, height: u32) -> Self {
        let r = Resolution::new(width, height);
        Self { min: r, max: r }
    }
}

/// Collapse the driver's per-entry min/max pairs into a set of distinct
/// resolutions.
pub fn collect_resolutions<I>(ranges: I) -> BTreeSet<Resolution>
where
    I: IntoIterator<Item = FrameSizeRange>,
{
    let mut resolutions = BTreeSet::new();
    for range in ranges {
        resolutions.insert(range.max);
        resolutions.insert(range.min);
    }
    resolutions
}

/// A pixel format advertised by the device together with the
/// resolutions it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFormat {
    /// Human readable description, e.g. "Motion-JPEG"
    pub name: String,
    /// Driver format code (the little-endian FourCC value)
    pub code: u32,
    pub resolutions: BTreeSet<Resolution>,
}

impl CameraFormat {
    pub fn new<I>(name: impl Into<String>, code: u32, ranges: I) -> Self
    where
        I: IntoIterator<Item = FrameSizeRange>,
    {
        Self {
            name: name.into(),
            code,
            resolutions: collect_resolutions(ranges),
        }
    }

    /// Four character code spelled out, if it is printable.
    pub fn fourcc(&self) -> Option<String> {
        let bytes = self.code.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            Some(String::from_utf8_lossy(&bytes).trim_end().to_string())
        } else {
            None
        }
    }

    /// Space separated list, e.g. "640x480 1280x720"
    pub fn resolutions_label(&self) -> String {
        self.resolutions
            .iter()
            .map(Resolution::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// An open capture session on one device.
///
/// Implementations are blocking; the capture loop drives them from a
/// dedicated blocking thread.
pub trait FrameSource: Send {
    /// Every pixel format the device advertises.
    fn formats(&mut self) -> Result<Vec<CameraFormat>, DeviceError>;

    /// Select the advertised format named `name` at `width` x `height`.
    fn negotiate_format(&mut self, name: &str, width: u32, height: u32)
        -> Result<(), DeviceError>;

    fn start_streaming(&mut self) -> Result<(), DeviceError>;

    /// Block until a frame is ready, or fail with
    /// [`DeviceError::Timeout`] after `timeout`.
    fn wait_frame(&mut self, timeout: Duration) -> Result<(), DeviceError>;

    /// Payload of the frame made ready by the last successful
    /// [`FrameSource::wait_frame`]. May be empty.
    fn read_frame(&mut self) -> Result<Bytes, DeviceError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Opens capture sessions.
pub trait CameraDriver: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>, DeviceError>;
}

static CLAIMED_DEVICES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive right to stream from one device path, released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    path: String,
}

impl DeviceClaim {
    /// Claim `path`, or `None` if another owner already holds it.
    pub fn acquire(path: &str) -> Option<Self> {
        let mut claimed = CLAIMED_DEVICES.lock();
        if !claimed.insert(path.to_string()) {
            return None;
        }
        debug!(device = %path, "Device claimed");
        Some(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        CLAIMED_DEVICES.lock().remove(&self.path);
        debug!(device = %self.path, "Device claim released");
    }
}
