//! Sending and receiving framed packets over a byte stream.
//!
//! Framing model:
//!
//! ```text
//! +------+-----------+----------------+---------------------------+
//! | type | msgid     | payload_length | payload (payload_length)  |
//! | u8   | u32 BE    | u32 BE         | bytes                     |
//! +------+-----------+----------------+---------------------------+
//! ```
//!
//! Both directions accumulate partial transfers until the requested
//! count is reached. As soon as the transport reports EOF (a zero-length
//! read or write) or an error, the packet fails; the stream should then be
//! considered unusable because part of a packet may already have been
//! consumed or emitted.

use std::fmt;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::wire_types::{PacketHeader, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Which part of a packet was being transferred.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Header,
    Payload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Header => write!(f, "header"),
            Stage::Payload => write!(f, "payload"),
        }
    }
}

/// Errors that can arise while sending or receiving a packet.
#[derive(Debug)]
pub enum ProtocolError {
    /// The transport hit EOF before the full count was transferred.
    ShortCount {
        stage: Stage,
        expected: usize,
        transferred: usize,
    },
    /// Header length field and supplied payload disagree.
    LengthMismatch { declared: u32, actual: usize },
    /// Declared payload exceeds [`MAX_PAYLOAD_LEN`].
    PayloadTooLarge(u32),
    /// The connection has been shut down locally.
    ConnectionClosed,
    /// Underlying transport error.
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ShortCount {
                stage,
                expected,
                transferred,
            } => write!(
                f,
                "Short count on {}: expected {} bytes, transferred {}",
                stage, expected, transferred
            ),
            ProtocolError::LengthMismatch { declared, actual } => write!(
                f,
                "Payload length mismatch: header says {}, payload has {}",
                declared, actual
            ),
            ProtocolError::PayloadTooLarge(len) => write!(
                f,
                "Payload of {} bytes exceeds limit of {}",
                len, MAX_PAYLOAD_LEN
            ),
            ProtocolError::ConnectionClosed => write!(f, "Connection closed"),
            ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

// ============================================================================
// SEND
// ============================================================================

/// Write one packet: header in full, then the payload in full.
///
/// `payload` must be exactly `header.payload_length` bytes long and no
/// longer than [`MAX_PAYLOAD_LEN`], the same limit [`recv_packet`]
/// enforces. Either violation is rejected before anything touches the
/// stream.
pub async fn send_packet<W>(
    writer: &mut W,
    header: &PacketHeader,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if header.payload_length > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(header.payload_length));
    }
    if header.payload_length as usize != payload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.payload_length,
            actual: payload.len(),
        });
    }

    let header_bytes = header.to_bytes();
    let written = write_full(writer, &header_bytes).await?;
    if written != HEADER_LEN {
        debug!(written, "short count writing header");
        return Err(ProtocolError::ShortCount {
            stage: Stage::Header,
            expected: HEADER_LEN,
            transferred: written,
        });
    }

    if !payload.is_empty() {
        let written = write_full(writer, payload).await?;
        if written != payload.len() {
            debug!(written, expected = payload.len(), "short count writing payload");
            return Err(ProtocolError::ShortCount {
                stage: Stage::Payload,
                expected: payload.len(),
                transferred: written,
            });
        }
    }

    writer.flush().await?;
    Ok(())
}

// ============================================================================
// RECEIVE
// ============================================================================

/// Read one packet.
///
/// Returns the header and the payload, or `None` when the header
/// announces an empty payload. On any failure no payload is returned,
/// even if the header was already consumed.
pub async fn recv_packet<R>(reader: &mut R) -> Result<(PacketHeader, Option<Bytes>), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    let read = read_full(reader, &mut header_bytes).await?;
    if read != HEADER_LEN {
        return Err(ProtocolError::ShortCount {
            stage: Stage::Header,
            expected: HEADER_LEN,
            transferred: read,
        });
    }

    let header = PacketHeader::from_bytes(&header_bytes);
    if header.payload_length == 0 {
        return Ok((header, None));
    }

    if header.payload_length > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(header.payload_length));
    }

    let expected = header.payload_length as usize;
    let mut payload = vec![0u8; expected];
    let read = read_full(reader, &mut payload).await?;
    if read != expected {
        debug!(read, expected, "short count reading payload");
        return Err(ProtocolError::ShortCount {
            stage: Stage::Payload,
            expected,
            transferred: read,
        });
    }

    Ok((header, Some(Bytes::from(payload))))
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

/// Read until `buf` is full or the reader reports EOF.
///
/// Returns the number of bytes actually read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write until `buf` is drained or the writer accepts zero bytes.
///
/// Returns the number of bytes actually written.
async fn write_full<W>(writer: &mut W, buf: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < buf.len() {
        let n = writer.write(&buf[written..]).await?;
        if n == 0 {
            break;
        }
        written += n;
    }
    Ok(written)
}
