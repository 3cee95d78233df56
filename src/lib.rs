//! MJPEG streaming for a V4L2 door camera
//!
//! One capture loop pulls Motion-JPEG frames off the camera and hands them
//! to a [`streaming::FrameDistributor`]; every `/video.mjpg` viewer gets its
//! own bounded subscription, so a slow viewer only ever loses its own
//! oldest frames.
//!
//! # Example
//!
//! ```no_run
//! use doorcam_mjpeg::{config::Config, server::Server, camera::V4l2Driver};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::default();
//! let driver = Arc::new(V4l2Driver::new(config.camera.buffer_count));
//! Server::new(config, driver).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod diagnostics;
pub mod server;
pub mod streaming;
pub mod web;

pub use camera::{CameraDriver, CameraFormat, DeviceError, FrameSource, Resolution, V4l2Driver};
pub use config::Config;
pub use server::Server;
pub use streaming::{CaptureLoop, Frame, FrameDistributor};
