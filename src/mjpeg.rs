//! multipart/x-mixed-replace framing for MJPEG over HTTP.

use bytes::{BufMut, Bytes, BytesMut};

pub const BOUNDARY: &str = "123456789000000000000987654321";

pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";

const PART_SEPARATOR: &str = "\r\n--123456789000000000000987654321\r\n";

/// One multipart chunk: separator, part headers and the JPEG payload.
pub fn part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(PART_SEPARATOR.len() + header.len() + jpeg.len());
    buf.put_slice(PART_SEPARATOR.as_bytes());
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.freeze()
}
