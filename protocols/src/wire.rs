//! Frame codec for both socket pairs.
//!
//! Messages are MessagePack records serialized in struct-map mode, so every
//! frame is self-describing and field order inside structs survives a
//! round-trip. On the wire each message is one frame: a little-endian u32
//! length prefix followed by the encoded body.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Eval results carry captured output, so the
/// cap is generous; anything larger indicates a desynchronized stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { len: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode a message in struct-map mode.
pub fn encode<T: Serialize>(msg: &T) -> WireResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    let mut ser = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    msg.serialize(&mut ser)?;
    Ok(buf)
}

/// Decode a message previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> WireResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { len: body.len() });
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> WireResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { len });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
