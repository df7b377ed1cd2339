//! Multipart framing over byte streams.
//!
//! A frame is `u32` part count followed by `u32` length + bytes for each part, all
//! little-endian. Links open with a [`Hello`] frame from the connecting side and an ack
//! frame from the accepting side.

use super::catalog::KindSet;
use super::codec::{self, CodecError};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on parts per frame; catalog messages use at most seven.
pub const MAX_PARTS: u32 = 64;

const HELLO_TAG: &[u8] = b"hello";
const ACK_TAG: &[u8] = b"ack";

/// Concatenates parts into one contiguous frame, ready for `write_all`.
pub fn encode_frame(parts: &[Bytes]) -> Bytes {
    let body: usize = parts.iter().map(|p| 4 + p.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + body);
    buf.put_u32_le(parts.len() as u32);
    for part in parts {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }
    buf.freeze()
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream before a frame starts.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<Vec<Bytes>>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32_le().await {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if count > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame has {count} parts, limit is {MAX_PARTS}"),
        ));
    }

    let mut parts = Vec::with_capacity(count as usize);
    let mut total = 0usize;
    for _ in 0..count {
        let len = reader.read_u32_le().await? as usize;
        total = total.saturating_add(len);
        if total > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {max_bytes} bytes"),
            ));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(Bytes::from(part));
    }
    Ok(Some(parts))
}

/// How the connecting side intends to use a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// One-way feed from a publisher, filtered by kind.
    Subscribe,
    /// Full-duplex point-to-point link between a receiver and a sender.
    Peer,
}

impl LinkRole {
    fn tag(self) -> &'static str {
        match self {
            LinkRole::Subscribe => "sub",
            LinkRole::Peer => "peer",
        }
    }
}

/// First frame sent by the connecting side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Which capability is connecting
    pub role: LinkRole,
    /// Name of the connecting participant.
    pub name: String,
    /// Kinds the connecting side wants to receive.
    pub kinds: KindSet,
}

impl Hello {
    /// Encodes as message parts.
    pub fn to_parts(&self) -> Vec<Bytes> {
        vec![
            Bytes::from_static(HELLO_TAG),
            codec::encode_str(self.role.tag()),
            codec::encode_str(&self.name),
            Bytes::copy_from_slice(&self.kinds.bits().to_le_bytes()),
        ]
    }

    /// Inverse of [`to_parts`](Self::to_parts).
    pub fn from_parts(parts: &[Bytes]) -> Result<Self, CodecError> {
        let [tag, role, name, kinds] = parts else {
            return Err(CodecError::Hello(format!("expected 4 parts, got {}", parts.len())));
        };
        if tag.as_ref() != HELLO_TAG {
            return Err(CodecError::Hello("missing hello tag".into()));
        }
        let role = match role.as_ref() {
            b"sub" => LinkRole::Subscribe,
            b"peer" => LinkRole::Peer,
            _ => return Err(CodecError::Hello("unknown link role".into())),
        };
        let bits: [u8; 2] = kinds
            .as_ref()
            .try_into()
            .map_err(|_| CodecError::Hello("kind set must be 2 bytes".into()))?;
        Ok(Self {
            role,
            name: codec::decode_str(name)?,
            kinds: KindSet::from_bits(u16::from_le_bytes(bits)),
        })
    }
}

/// Parts of the reply that completes a handshake.
pub fn ack_parts() -> Vec<Bytes> {
    vec![Bytes::from_static(ACK_TAG)]
}

/// Whether `parts` are an ack.
pub fn is_ack(parts: &[Bytes]) -> bool {
    matches!(parts, [tag] if tag.as_ref() == ACK_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Message, MessageKind, Payload};

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let msg = Message::new("w1", Payload::String("hello".into()));
        let mut wire = encode_frame(&msg.encode().unwrap()).to_vec();
        wire.extend_from_slice(&encode_frame(&ack_parts()));

        let mut reader = &wire[..];
        let parts = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(Message::decode(&parts).unwrap(), msg);
        let ack = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert!(is_ack(&ack));
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let wire = encode_frame(&[Bytes::from(vec![0u8; 64])]);
        let mut reader = &wire[..];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let wire = encode_frame(&[Bytes::from_static(b"abcdef")]);
        let mut reader = &wire[..wire.len() - 2];
        assert!(read_frame(&mut reader, 1024).await.is_err());
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello {
            role: LinkRole::Subscribe,
            name: "saver".into(),
            kinds: KindSet::of(&[MessageKind::Exit, MessageKind::Frame]),
        };
        assert_eq!(Hello::from_parts(&hello.to_parts()).unwrap(), hello);
        assert!(Hello::from_parts(&ack_parts()).is_err());
    }
}
