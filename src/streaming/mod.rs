//! Frame production and fan-out

pub mod capture;
pub mod frame;
pub mod frame_distributor;

pub use capture::{CaptureError, CaptureLoop, CaptureMonitor, CaptureSettings, CaptureState, CaptureStats};
pub use frame::{encode_part, Frame, BOUNDARY, STREAM_CONTENT_TYPE};
pub use frame_distributor::{DistributorStats, FrameDistributor, Subscription, SubscriptionStats};
