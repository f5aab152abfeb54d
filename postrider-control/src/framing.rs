//! Frame layer: 4-byte little-endian length prefix, bincode body
//!
//! Both directions use the same framing. The length cap bounds memory
//! per connection; a peer announcing more is protocol-broken and the
//! connection is torn down.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ControlError;

/// Maximum frame body size
pub const MAX_FRAME_BYTES: u32 = 2 * 1024 * 1024;

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, body: &T) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serde::encode_to_vec(body, bincode::config::legacy())?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| ControlError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(ControlError::FrameTooLarge(len));
    }

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
pub async fn read_frame<R, T>(reader: &mut R) -> crate::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ControlError::FrameTooLarge(len));
    }

    let mut body = vec![0_u8; len as usize];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let (decoded, _) = bincode::serde::decode_from_slice(&body, bincode::config::legacy())?;
    Ok(decoded)
}
