//! Multiplexed stream frames of hijacked attach/exec sessions.
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | stream |    0   |    0   |    0   |          payload length (BE)      |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```

use crate::error::{ProxyError, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    /// Input written by the client.
    Stdin = 0,
    /// Standard output of the process.
    Stdout = 1,
    /// Standard error of the process.
    Stderr = 2,
}

impl TryFrom<u8> for StreamType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            other => Err(ProxyError::Protocol(format!(
                "unknown stream type {other} in frame header"
            ))),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream the payload belongs to.
    pub stream: StreamType,
    /// Payload length in bytes.
    pub len: u32,
}

impl FrameHeader {
    /// Parses a raw frame header.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for an unknown stream type.
    pub fn parse(raw: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        Ok(Self {
            stream: StreamType::try_from(raw[0])?,
            len: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let len = self.len.to_be_bytes();
        [self.stream as u8, 0, 0, 0, len[0], len[1], len[2], len[3]]
    }
}

/// Totals of a finished pump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Frames relayed.
    pub frames: u64,
    /// Bytes relayed, headers included.
    pub bytes: u64,
}

/// Relays frames from `remote` to `client` until the remote closes.
///
/// Each frame header is validated before it is written, then exactly the
/// declared number of payload bytes is copied. End-of-stream on a frame
/// boundary ends the pump cleanly.
///
/// # Errors
///
/// - [`ProxyError::Protocol`] for an unknown stream type.
/// - [`ProxyError::Framing`] if the remote closes inside a frame.
/// - [`ProxyError::Connectivity`] if either side fails.
pub async fn pump_frames<R, W>(remote: &mut R, client: &mut W) -> Result<PumpStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = PumpStats::default();

    loop {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        let filled = read_header(remote, &mut raw).await?;
        if filled == 0 {
            break;
        }
        if filled < FRAME_HEADER_LEN {
            return Err(ProxyError::Framing {
                expected: FRAME_HEADER_LEN as u64,
                received: filled as u64,
            });
        }

        let header = FrameHeader::parse(&raw)?;
        client.write_all(&raw).await?;

        let expected = u64::from(header.len);
        let received = tokio::io::copy(&mut (&mut *remote).take(expected), client).await?;
        client.flush().await?;

        stats.frames += 1;
        stats.bytes += FRAME_HEADER_LEN as u64 + received;

        if received < expected {
            return Err(ProxyError::Framing { expected, received });
        }
        tracing::trace!(stream = %header.stream, len = header.len, "relayed frame");
    }

    client.flush().await?;
    Ok(stats)
}

async fn read_header<R: AsyncRead + Unpin>(
    remote: &mut R,
    raw: &mut [u8; FRAME_HEADER_LEN],
) -> Result<usize> {
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = remote.read(&mut raw[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader {
            stream,
            len: u32::try_from(payload.len()).unwrap(),
        };
        let mut out = header.encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parse_header() {
        let raw = [2, 0, 0, 0, 0, 0, 1, 2];
        let header = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.stream, StreamType::Stderr);
        assert_eq!(header.len, 258);
        assert_eq!(header.encode(), raw);
    }

    #[test]
    fn unknown_stream_type_is_protocol_error() {
        let raw = [7, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            FrameHeader::parse(&raw),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn relays_header_plus_payload_bytes() {
        let payloads: [&[u8]; 3] = [b"hello\n", b"", b"some error output"];
        let mut input = Vec::new();
        input.extend(frame(StreamType::Stdout, payloads[0]));
        input.extend(frame(StreamType::Stdout, payloads[1]));
        input.extend(frame(StreamType::Stderr, payloads[2]));

        let mut remote = input.as_slice();
        let mut client = Vec::new();
        let stats = pump_frames(&mut remote, &mut client).await.unwrap();

        let payload_total: usize = payloads.iter().map(|p| p.len()).sum();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.bytes as usize, payload_total + 3 * FRAME_HEADER_LEN);
        assert_eq!(client, input);
    }

    #[tokio::test]
    async fn short_payload_is_framing_error() {
        let mut input = FrameHeader {
            stream: StreamType::Stdout,
            len: 100,
        }
        .encode()
        .to_vec();
        input.extend_from_slice(b"only ten b");

        let mut remote = input.as_slice();
        let mut client = Vec::new();
        let err = pump_frames(&mut remote, &mut client).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Framing {
                expected: 100,
                received: 10
            }
        ));
        assert_eq!(client.len(), FRAME_HEADER_LEN + 10);
    }

    #[tokio::test]
    async fn truncated_header_is_framing_error() {
        let mut remote: &[u8] = &[1, 0, 0];
        let mut client = Vec::new();
        assert!(matches!(
            pump_frames(&mut remote, &mut client).await,
            Err(ProxyError::Framing {
                expected: 8,
                received: 3
            })
        ));
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn bad_stream_type_is_not_relayed() {
        let mut input = frame(StreamType::Stdout, b"ok");
        input.extend_from_slice(&[9, 0, 0, 0, 0, 0, 0, 1, b'x']);

        let mut remote = input.as_slice();
        let mut client = Vec::new();
        assert!(matches!(
            pump_frames(&mut remote, &mut client).await,
            Err(ProxyError::Protocol(_))
        ));
        assert_eq!(client, frame(StreamType::Stdout, b"ok"));
    }

    #[tokio::test]
    async fn empty_stream_ends_cleanly() {
        let mut remote: &[u8] = &[];
        let mut client = Vec::new();
        let stats = pump_frames(&mut remote, &mut client).await.unwrap();
        assert_eq!(stats, PumpStats::default());
    }
}
