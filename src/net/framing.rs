//! Message framing for length-prefixed protocol
//!
//! Handles reading and writing framed messages over streams.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::net::protocol::{MAX_BULK_FRAME_SIZE, MAX_FRAME_SIZE};

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    /// Frame over the session limit; its payload was drained and the stream
    /// is still aligned
    #[error("Frame of {0} bytes dropped")]
    Oversized(usize),
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    /// Whether the stream can keep being read after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::Oversized(_))
    }
}

/// Read a session frame with the default limits
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    read_frame(stream, MAX_FRAME_SIZE, MAX_BULK_FRAME_SIZE).await
}

/// Read a length-prefixed frame from a stream
///
/// Format: [4 bytes little-endian length][payload]
///
/// Frames above `limit` but within `hard_limit` are skipped and reported as
/// [`FramingError::Oversized`]. Anything above `hard_limit` is fatal.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    limit: usize,
    hard_limit: usize,
) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    if len > hard_limit {
        return Err(FramingError::MessageTooLarge(len, hard_limit));
    }

    if len > limit {
        let mut payload = (&mut *stream).take(len as u64);
        let drained = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        if drained < len as u64 {
            return Err(FramingError::ConnectionClosed);
        }
        return Err(FramingError::Oversized(len));
    }

    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(FramingError::ConnectionClosed)
        }
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Write a length-prefixed message to a stream
///
/// Format: [4 bytes little-endian length][payload]
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_BULK_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_BULK_FRAME_SIZE));
    }

    let len_bytes = (data.len() as u32).to_le_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_write_message() {
        let data = "name\u{FFFF}Alice".as_bytes();
        let mut buffer = Vec::new();

        write_message(&mut buffer, data).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await.unwrap();

        assert_eq!(result, data);
    }

    #[tokio::test]
    async fn test_empty_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        assert!(read_message(&mut cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_drained() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &vec![b'a'; MAX_FRAME_SIZE + 1]).await.unwrap();
        write_message(&mut buffer, b"i").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::Oversized(n) if n == MAX_FRAME_SIZE + 1));
        assert!(err.is_recoverable());

        // Stream is still aligned on the next frame
        assert_eq!(read_message(&mut cursor).await.unwrap(), b"i");
    }

    #[tokio::test]
    async fn test_frame_over_hard_limit_is_fatal() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&64u32.to_le_bytes());
        buffer.extend_from_slice(&[b'a'; 64]);

        let mut cursor = Cursor::new(buffer);
        let err = read_frame(&mut cursor, 16, 32).await.unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge(64, 32)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_write_over_hard_limit() {
        let large_data = vec![0u8; MAX_BULK_FRAME_SIZE + 1];
        let mut buffer = Vec::new();

        let result = write_message(&mut buffer, &large_data).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_read_truncated_length() {
        let mut cursor = Cursor::new(vec![0u8; 2]);

        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_truncated_oversized_frame() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&((MAX_FRAME_SIZE + 10) as u32).to_le_bytes());
        buffer.extend_from_slice(&[b'a'; 5]);

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }
}
