// Wire format: [u32 big-endian length][JSON frame]
//
// JSON keeps frames readable in packet captures and lets workers written in
// other languages speak the protocol without a schema compiler.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::events::Event;

/// Default upper bound for a single frame: 16 MiB. Full snapshots of large
/// ensembles are the biggest frames on the wire.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// What a connected peer is allowed to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Runs inside a realization and reports step events.
    Worker,
    /// Observes snapshots and may cancel the iteration.
    Monitor,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Worker => "worker",
            PeerRole::Monitor => "monitor",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Must precede any other frame from a peer.
    Connect { identity: String, role: PeerRole },
    /// Sent before closing; a disconnected worker is not failed.
    Disconnect,
    /// Liveness signal, in both directions.
    Heartbeat,
    /// Acknowledges the event with sequence number `event_id`.
    Ack { event_id: u64 },
    /// Payload, numbered by a per-source monotonically increasing `seq`.
    Event { seq: u64, event: Event },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "CONNECT",
            Frame::Disconnect => "DISCONNECT",
            Frame::Heartbeat => "HEARTBEAT",
            Frame::Ack { .. } => "ACK",
            Frame::Event { .. } => "EVENT",
        }
    }
}

/// A frame tagged with the identity of the peer it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub identity: String,
    pub frame: Frame,
}

/// Encode a frame with its length prefix.
pub fn encode_frame(frame: &Frame, max_frame_bytes: usize) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > max_frame_bytes || payload.len() > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            limit: max_frame_bytes,
        });
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed, or `None` when `buf`
/// does not yet hold a complete frame.
pub fn decode_frame(
    buf: &[u8],
    max_frame_bytes: usize,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_BYTES) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: max_frame_bytes,
        });
    }
    let end = LENGTH_PREFIX_BYTES + len;
    let Some(payload) = buf.get(LENGTH_PREFIX_BYTES..end) else {
        return Ok(None);
    };
    let frame = serde_json::from_slice(payload)?;
    Ok(Some((frame, end)))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(
    io: &mut W,
    frame: &Frame,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame, max_frame_bytes)?;
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
pub async fn read_frame<R>(
    io: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
    match io.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: max_frame_bytes,
        });
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
