/// Length-prefixed framing for stream transports
///
/// Every frame is a 4-byte little-endian length followed by that many payload
/// bytes. Both the bus socket and the request/response channel use it.
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted on the wire
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame of {} bytes exceeds limit of {} bytes",
                payload.len(),
                MAX_FRAME_SIZE
            ),
        ));
    }

    let len_bytes = (payload.len() as u32).to_le_bytes();
    writer.write_all(&len_bytes).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buffer = [0u8; 4];
    match reader.read_exact(&mut len_buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_le_bytes(len_buffer) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }

    let mut payload = vec![0u8; frame_len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_keep_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        write_frame(&mut client, b"{\"x\":1}").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"{\"x\":1}");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_payload_not_written() {
        let (mut client, _server) = tokio::io::duplex(64);
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = write_frame(&mut client, &payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }
}
