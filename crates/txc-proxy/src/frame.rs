//! `\0`-terminated framing used on both proxy sockets.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const TERMINATOR: u8 = 0;

/// Outcome of [`read_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete frame, terminator included, is in the buffer.
    Complete,
    /// Peer closed the stream; a trailing unterminated fragment is discarded.
    Eof,
    /// Frame exceeded the limit before its terminator.
    TooLong,
}

/// Read one frame into `buf` (cleared first).
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(Frame::Eof);
        }
        let (chunk, done) = match available.iter().position(|&b| b == TERMINATOR) {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let used = chunk.len();
        if buf.len() + used > max_len {
            // drop what is buffered so closing the socket does not reset it
            reader.consume(used);
            return Ok(Frame::TooLong);
        }
        buf.extend_from_slice(chunk);
        reader.consume(used);
        if done {
            return Ok(Frame::Complete);
        }
    }
}

/// Write `payload` followed by the terminator.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.write_all(&[TERMINATOR]).await?;
    writer.flush().await
}

/// Frame contents without the terminator.
#[inline]
pub fn payload(frame: &[u8]) -> &[u8] {
    frame.strip_suffix(&[TERMINATOR]).unwrap_or(frame)
}
