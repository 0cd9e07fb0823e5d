//! Frame codec
//!
//! Format: `[version:1][type:1][length:4 LE][payload:N][crc32:4 LE]`
//!
//! The payload is bincode. The CRC covers header and payload. A frame is
//! always read completely before it is decoded, so a corrupt frame leaves
//! the stream positioned on the next one.

use super::message::{MessageType, ReplicationMessage};
use super::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::{Error, Result};
use crc32fast::Hasher;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// version + type + length
pub const HEADER_LEN: usize = 6;

/// Trailing checksum
pub const CRC_LEN: usize = 4;

/// Largest payload accepted; anything bigger is treated as a broken stream
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Encode a message as one frame stamped with `version`
pub fn encode(message: &ReplicationMessage, version: u8) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| Error::codec(format!("Serialization failed: {}", e)))?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::codec(format!(
            "Payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    buf.push(version);
    buf.push(message.message_type() as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(buf)
}

/// Decode one complete frame
pub fn decode(buf: &[u8]) -> Result<ReplicationMessage> {
    decode_versioned(buf).map(|(_, message)| message)
}

/// Decode one complete frame, returning the version byte it carried
pub fn decode_versioned(buf: &[u8]) -> Result<(u8, ReplicationMessage)> {
    if buf.len() < HEADER_LEN + CRC_LEN {
        return Err(Error::codec("Frame too short"));
    }

    let crc_offset = buf.len() - CRC_LEN;
    let stored_crc = read_u32(&buf[crc_offset..]);
    let mut hasher = Hasher::new();
    hasher.update(&buf[..crc_offset]);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(Error::codec(format!(
            "CRC mismatch: expected {:x}, got {:x}",
            stored_crc, computed_crc
        )));
    }

    let version = buf[0];
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(Error::codec(format!("Unsupported frame version {}", version)));
    }
    let message_type = MessageType::try_from(buf[1])?;

    let length = read_u32(&buf[2..HEADER_LEN]) as usize;
    if HEADER_LEN + length != crc_offset {
        return Err(Error::codec(format!(
            "Length field {} disagrees with frame size {}",
            length,
            buf.len()
        )));
    }

    let message: ReplicationMessage = bincode::deserialize(&buf[HEADER_LEN..crc_offset])
        .map_err(|e| Error::codec(format!("Deserialization failed: {}", e)))?;
    if message.message_type() != message_type {
        return Err(Error::codec(format!(
            "Type byte {:?} disagrees with payload {:?}",
            message_type,
            message.message_type()
        )));
    }
    Ok((version, message))
}

/// Read one whole frame from a stream without decoding it
///
/// I/O errors and oversize length fields are fatal for the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let length = read_u32(&header[2..]) as usize;
    if length > MAX_PAYLOAD_LEN {
        return Err(Error::protocol(format!(
            "Frame length {} exceeds the {} byte limit",
            length, MAX_PAYLOAD_LEN
        )));
    }

    let mut frame = vec![0u8; HEADER_LEN + length + CRC_LEN];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(frame)
}

/// Write one message as a frame and flush
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ReplicationMessage,
    version: u8,
) -> Result<()> {
    let buf = encode(message, version)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one frame
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ReplicationMessage> {
    let frame = read_frame(reader).await?;
    decode(&frame)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}
