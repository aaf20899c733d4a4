//! Codec for encoding/decoding channel handshake messages

use crate::messages::ChannelMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Channel closed during handshake")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Handshake message codec
pub struct ChannelCodec;

impl ChannelCodec {
    /// Handshake messages are tiny; anything bigger is a protocol violation.
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Encode a message to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized message]
    pub fn encode(msg: &ChannelMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ChannelMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: ChannelMessage = bincode::deserialize(&msg_bytes)?;
        Ok(Some(msg))
    }
}

/// Write one handshake message to a stream
pub async fn write_message<W>(writer: &mut W, msg: &ChannelMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = ChannelCodec::encode(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one handshake message from a stream
///
/// Reads the length prefix first so no byte past the message is consumed;
/// whatever follows belongs to the forwarded data.
pub async fn read_message<R>(reader: &mut R) -> Result<ChannelMessage, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    reader
        .read_exact(&mut length_bytes)
        .await
        .map_err(map_eof)?;
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length > ChannelCodec::MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    Ok(bincode::deserialize(&payload)?)
}

fn map_eof(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::UnexpectedEof
    } else {
        CodecError::IoError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_incomplete() {
        let msg = ChannelMessage::open("forward1");
        let encoded = ChannelCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((ChannelCodec::MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());

        let result = ChannelCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_message_leaves_trailing_data() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_message(&mut client, &ChannelMessage::Accepted)
            .await
            .unwrap();
        client.write_all(b"payload").await.unwrap();
        drop(client);

        let msg = read_message(&mut server).await.unwrap();
        assert_eq!(msg, ChannelMessage::Accepted);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(CodecError::UnexpectedEof)));
    }
}
