//! Network Module
//!
//! Framed TCP transport between keepers, stewardctl, and the monitor.
//! A frame is an 8-byte prefix (payload length + crc32) followed by the
//! bincode payload; both directions use the same two helpers.

pub mod client;
pub mod server;

pub use client::MonitorClient;
pub use server::ProtocolServer;

use crate::error::{Error, Result};
use crate::protocol::{FrameHeader, Message};

/// Upper bound on a single frame (16 MB). Real messages top out at a few
/// kilobytes; anything near this limit is corrupt or hostile.
const FRAME_LIMIT: usize = 16 * 1024 * 1024;

/// Receive one framed message
pub async fn recv_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    let mut prefix = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut prefix).await?;
    let header = FrameHeader::from_bytes(&prefix);

    let announced = header.length as usize;
    if announced > FRAME_LIMIT {
        return Err(Error::Network(format!(
            "refusing a {announced} byte frame (limit is {FRAME_LIMIT})"
        )));
    }

    let mut payload = vec![0u8; announced];
    reader.read_exact(&mut payload).await?;

    if crc32fast::hash(&payload) != header.checksum {
        return Err(Error::Network(
            "frame checksum does not match its payload".into(),
        ));
    }

    Message::deserialize(&payload).map_err(Into::into)
}

/// Send one framed message
pub async fn send_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let payload = message.serialize()?;
    let header = FrameHeader::new(&payload);

    // One buffer, one write: prefix and payload never land separately
    let mut frame = Vec::with_capacity(FrameHeader::SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_through_buffer() {
        let msg = Message::GetPrimary {
            formation: "default".to_string(),
            group: 0,
        };

        let mut buf = Vec::new();
        send_frame(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let restored = recv_frame(&mut cursor).await.unwrap();
        assert_eq!(restored.type_name(), "GetPrimary");
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_rejected() {
        let msg = Message::Ack;
        let mut buf = Vec::new();
        send_frame(&mut buf, &msg).await.unwrap();

        // Flip a payload byte; the checksum must catch it
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        // Hand-build a prefix announcing more than the limit
        let bogus = FrameHeader {
            length: (FRAME_LIMIT + 1) as u32,
            checksum: 0,
        };
        let mut cursor = std::io::Cursor::new(bogus.to_bytes().to_vec());
        let err = recv_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
