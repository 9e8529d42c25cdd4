//! Length-prefixed frame I/O over a byte stream.
//!
//! Each frame on the stream transport is a u32 big-endian length followed
//! by the 13-byte header and the payload. The datagram transport sends the
//! header + payload without the length prefix (one frame per datagram).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use conclave_core::wire::{Frame, WireError, HEADER_LEN, MAX_FRAME};

use crate::NetError;

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, NetError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(NetError::Wire(WireError::FrameTooLarge(len)));
    }
    if len < HEADER_LEN {
        return Err(NetError::Wire(WireError::Truncated));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let frame = Frame::decode(buf.into())?;
    Ok(Some(frame))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), NetError> {
    let body = frame.encode();
    if body.len() > MAX_FRAME {
        return Err(NetError::Wire(WireError::FrameTooLarge(body.len())));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
