//! # Length-Prefixed Framing
//!
//! Purpose: Delimit opaque payloads on a byte stream with a 4-byte
//! big-endian signed length prefix.
//!
//! ## Design Principles
//! 1. **Opaque Payloads**: The codec never looks past the length prefix.
//! 2. **Exact Reads**: A single `read` may return fewer bytes than asked for;
//!    the accumulator loops until the count is met.
//! 3. **EOF Is an Error**: A zero-length read means the peer closed the
//!    socket, never an empty message.
//! 4. **Generic Over `Read`**: Works on sockets, TLS streams and test doubles.
//!
//! ## Wire Layout
//!
//! ```text
//! +-------------+------------------+
//! | len:4B (BE) | payload: len B   |
//! +-------------+------------------+
//! ```

use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest request made to the underlying reader in one call.
const READ_CHUNK: usize = 4096;

/// Appends `payload` to `out` as a single frame.
///
/// Fails with `InvalidInput` when the payload does not fit a signed 32-bit
/// length.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) -> io::Result<()> {
    let len = i32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds frame limit", payload.len()),
        )
    })?;
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_i32(len);
    out.put_slice(payload);
    Ok(())
}

/// Reads exactly `len` bytes from `reader`, appending them to `out`.
///
/// Short reads are retried and `Interrupted` is retried transparently. A
/// read returning zero bytes before `len` is reached yields
/// `UnexpectedEof`.
///
/// `out` grows one chunk at a time; `len` usually comes from the peer and is
/// never trusted for an up-front allocation.
pub fn read_exact_bytes<R: Read>(
    reader: &mut R,
    len: usize,
    out: &mut BytesMut,
) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut left = len;

    while left > 0 {
        let want = left.min(READ_CHUNK);
        out.reserve(want);
        let read = match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "not enough data to read message, did the server kill the socket?",
                ))
            }
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        out.extend_from_slice(&chunk[..read]);
        left -= read;
        trace!(read = len - left, total = len, "read bytes from broker");
    }

    Ok(())
}

/// Reads one frame and returns its payload without the prefix.
///
/// A negative length prefix is reported as `InvalidData`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Bytes> {
    let mut header = BytesMut::with_capacity(FRAME_HEADER_LEN);
    read_exact_bytes(reader, FRAME_HEADER_LEN, &mut header)?;
    let size = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let size = usize::try_from(size).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative frame length {}", size),
        )
    })?;

    let mut payload = BytesMut::new();
    read_exact_bytes(reader, size, &mut payload)?;
    Ok(payload.freeze())
}
