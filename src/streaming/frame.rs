//! Frame envelope and multipart/x-mixed-replace framing

use bytes::{BufMut, Bytes, BytesMut};
use std::time::SystemTime;

/// Multipart boundary token. Part of the wire contract with MJPEG clients.
pub const BOUNDARY: &str = "MJPEGBOUNDARY";

/// `Content-Type` of a `/video.mjpg` response.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=MJPEGBOUNDARY";

/// Write the part header that precedes a JPEG payload of `len` bytes.
pub fn put_part_header(buf: &mut BytesMut, len: usize) {
    buf.put_slice(b"\r\n--");
    buf.put_slice(BOUNDARY.as_bytes());
    buf.put_slice(b"\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(b"\r\nX-Timestamp: 0.000000\r\n\r\n");
}

/// Build one complete multipart chunk for `payload`.
pub fn encode_part(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 128);
    put_part_header(&mut buf, payload.len());
    buf.put_slice(payload);
    buf.freeze()
}

/// One captured JPEG image plus its delivery envelope.
///
/// The part header is encoded once at capture time. Header and payload
/// are shared by every subscriber without copying; cloning a `Frame`
/// only bumps reference counts.
#[derive(Debug, Clone)]
pub struct Frame {
    sequence: u64,
    captured_at: SystemTime,
    header: Bytes,
    payload: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        Self::with_timestamp(sequence, payload, SystemTime::now())
    }

    pub fn with_timestamp(sequence: u64, payload: Bytes, captured_at: SystemTime) -> Self {
        let mut header = BytesMut::with_capacity(128);
        put_part_header(&mut header, payload.len());
        Self {
            sequence,
            captured_at,
            header: header.freeze(),
            payload,
        }
    }

    /// Capture order, starting at 0 for the first frame of the process.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Raw JPEG bytes.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Part header and payload, in wire order.
    pub fn parts(&self) -> [Bytes; 2] {
        [self.header.clone(), self.payload.clone()]
    }

    /// The whole part in one buffer. Copies the payload.
    pub fn chunk(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.len() + self.payload.len());
        buf.put_slice(&self.header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_matches_wire_format() {
        let payload = b"\xff\xd8jpeg-bytes\xff\xd9";
        let chunk = encode_part(payload);

        let mut expected = format!(
            "\r\n--MJPEGBOUNDARY\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: 0.000000\r\n\r\n",
            payload.len()
        )
        .into_bytes();
        expected.extend_from_slice(payload);

        assert_eq!(&chunk[..], &expected[..]);
    }

    #[test]
    fn test_empty_payload_header() {
        let chunk = encode_part(b"");
        assert_eq!(
            &chunk[..],
            b"\r\n--MJPEGBOUNDARY\r\nContent-Type: image/jpeg\r\nContent-Length: 0\r\nX-Timestamp: 0.000000\r\n\r\n"
        );
    }

    #[test]
    fn test_frame_payload_view() {
        let payload = vec![0xAB; 4096];
        let frame = Frame::new(7, Bytes::from(payload.clone()));

        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.payload_len(), 4096);
        assert_eq!(&frame.payload()[..], &payload[..]);
        assert!(frame.chunk().starts_with(b"\r\n--MJPEGBOUNDARY\r\n"));
        assert!(frame.chunk().ends_with(&payload));
    }

    #[test]
    fn test_parts_match_encoded_part() {
        let payload = Bytes::from_static(b"\xff\xd8abc\xff\xd9");
        let frame = Frame::new(0, payload.clone());

        let [header, body] = frame.parts();
        let mut joined = header.to_vec();
        joined.extend_from_slice(&body);

        assert_eq!(&joined[..], &encode_part(&payload)[..]);
        assert_eq!(frame.chunk(), encode_part(&payload));
    }

    #[test]
    fn test_payload_is_not_copied() {
        let payload = Bytes::from(vec![1u8; 1024]);
        let frame = Frame::new(1, payload.clone());
        let copy = frame.clone();

        assert_eq!(frame.payload().as_ptr(), payload.as_ptr());
        assert_eq!(copy.parts()[1].as_ptr(), payload.as_ptr());
    }

    #[test]
    fn test_content_type_names_boundary() {
        assert!(STREAM_CONTENT_TYPE.ends_with(BOUNDARY));
    }
}
