//! Video4Linux2 camera backend

use bytes::Bytes;
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::{
    buffer::Type,
    framesize::FrameSizeEnum,
    io::traits::CaptureStream,
    prelude::MmapStream,
    video::Capture,
    Device, Format, FourCC,
};

use super::{CameraDriver, CameraFormat, DeviceError, FrameSizeRange, FrameSource, Resolution};

/// Opens `/dev/videoN` nodes through libv4l.
#[derive(Debug, Clone)]
pub struct V4l2Driver {
    buffer_count: u32,
}

impl V4l2Driver {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
        }
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CameraDriver for V4l2Driver {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>, DeviceError> {
        let device = Device::with_path(path).map_err(|source| {
            if source.kind() == io::ErrorKind::ResourceBusy {
                DeviceError::Busy {
                    path: path.to_string(),
                }
            } else {
                DeviceError::Open {
                    path: path.to_string(),
                    source,
                }
            }
        })?;

        debug!(device = %path, "V4L2 device opened");

        Ok(Box::new(V4l2Source {
            path: path.to_string(),
            buffer_count: self.buffer_count,
            stream: None,
            device: Some(device),
            cursor: RingCursor::default(),
            pending: None,
        }))
    }
}

/// One open V4L2 session.
///
/// Field order matters: the mmap stream must be released before the
/// device handle.
pub struct V4l2Source {
    path: String,
    buffer_count: u32,
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    cursor: RingCursor,
    pending: Option<Bytes>,
}

impl V4l2Source {
    fn device(&self) -> Result<&Device, DeviceError> {
        self.device.as_ref().ok_or(DeviceError::NotStreaming)
    }
}

fn fourcc_code(fourcc: FourCC) -> u32 {
    u32::from_le_bytes(fourcc.repr)
}

/// The driver's buffer ring, seen from the capturing side.
trait BufferRing {
    /// Dequeue a filled buffer without reading it.
    fn reclaim(&mut self) -> io::Result<()>;

    /// Requeue the buffer we hold, then dequeue and copy the next frame.
    fn next_frame(&mut self) -> io::Result<Bytes>;
}

impl BufferRing for MmapStream<'static> {
    fn reclaim(&mut self) -> io::Result<()> {
        CaptureStream::dequeue(self).map(|_| ())
    }

    fn next_frame(&mut self) -> io::Result<Bytes> {
        let (buf, meta) = CaptureStream::next(self)?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(Bytes::copy_from_slice(&buf[..used]))
    }
}

/// Buffer bookkeeping across timeouts.
///
/// A dequeue that times out leaves the buffer we would requeue still
/// sitting in the driver's queue, and queueing it twice fails with
/// EINVAL. After a timeout the next wait therefore dequeues first and
/// only then goes through the normal requeue/dequeue cycle. The frame in
/// the reclaimed buffer is discarded.
#[derive(Debug, Default)]
struct RingCursor {
    stalled: bool,
}

impl RingCursor {
    fn wait<R: BufferRing>(&mut self, ring: &mut R) -> io::Result<Bytes> {
        if self.stalled {
            ring.reclaim()?;
            self.stalled = false;
            debug!("Buffer reclaimed after frame timeout");
        }

        match ring.next_frame() {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                self.stalled = true;
                Err(e)
            }
            result => result,
        }
    }
}

impl FrameSource for V4l2Source {
    fn formats(&mut self) -> Result<Vec<CameraFormat>, DeviceError> {
        let device = self.device()?;
        let descriptions = device.enum_formats().map_err(DeviceError::Enumerate)?;

        let mut formats = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            let sizes = device
                .enum_framesizes(description.fourcc)
                .map_err(DeviceError::Enumerate)?;

            let ranges = sizes.into_iter().map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => FrameSizeRange::discrete(d.width, d.height),
                FrameSizeEnum::Stepwise(s) => FrameSizeRange {
                    min: Resolution::new(s.min_width, s.min_height),
                    max: Resolution::new(s.max_width, s.max_height),
                },
            });

            formats.push(CameraFormat::new(
                description.description.clone(),
                fourcc_code(description.fourcc),
                ranges,
            ));
        }

        Ok(formats)
    }

    fn negotiate_format(&mut self, name: &str, width: u32, height: u32) -> Result<(), DeviceError> {
        let device = self.device()?;
        let descriptions = device.enum_formats().map_err(DeviceError::Enumerate)?;

        let fourcc = descriptions
            .iter()
            .find(|d| d.description == name)
            .map(|d| d.fourcc)
            .ok_or_else(|| {
                DeviceError::FormatNegotiation(format!(
                    "{} does not advertise a '{}' pixel format",
                    self.path, name
                ))
            })?;

        let requested = Format::new(width, height, fourcc);
        let applied = device.set_format(&requested).map_err(|e| {
            DeviceError::FormatNegotiation(format!(
                "{} rejected {} {}x{}: {}",
                self.path, name, width, height, e
            ))
        })?;

        if applied.fourcc != fourcc {
            return Err(DeviceError::FormatNegotiation(format!(
                "{} switched pixel format to {}",
                self.path, applied.fourcc
            )));
        }

        if applied.width != width || applied.height != height {
            warn!(
                device = %self.path,
                requested = %format!("{}x{}", width, height),
                applied = %format!("{}x{}", applied.width, applied.height),
                "Driver adjusted capture resolution"
            );
        }

        info!(device = %self.path, format = %applied, "Camera format set");
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        let stream = {
            let device = self.device()?;
            MmapStream::with_buffers(device, Type::VideoCapture, self.buffer_count)
                .map_err(DeviceError::Stream)?
        };

        info!(device = %self.path, buffers = self.buffer_count, "Capture stream ready");
        self.stream = Some(stream);
        self.cursor = RingCursor::default();
        Ok(())
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotStreaming)?;
        stream.set_timeout(timeout);

        match self.cursor.wait(stream) {
            Ok(payload) => {
                self.pending = Some(payload);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(DeviceError::Timeout(timeout)),
            Err(e) => Err(DeviceError::Read(e)),
        }
    }

    fn read_frame(&mut self) -> Result<Bytes, DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::NotStreaming);
        }
        Ok(self.pending.take().unwrap_or_default())
    }

    fn close(&mut self) {
        self.pending = None;
        self.cursor = RingCursor::default();
        if self.stream.take().is_some() || self.device.is_some() {
            debug!(device = %self.path, "V4L2 device closed");
        }
        self.device = None;
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}
