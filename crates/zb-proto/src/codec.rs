//! Length-prefixed SSZ framing.
//!
//! Every frame is a 4-byte big-endian length followed by the SSZ encoding of
//! the frame.

use ssz::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSZ decode error: {0}")]
    Decode(String),

    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("Stream closed in the middle of a frame")]
    Truncated,
}

/// Encode a frame into its on-wire form, length prefix included.
pub fn encode_frame(frame: &impl Encode) -> Result<Vec<u8>, CodecError> {
    let body = frame.as_ssz_bytes();
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame body (without the length prefix).
pub fn decode_frame<T: Decode>(body: &[u8]) -> Result<T, CodecError> {
    T::from_ssz_bytes(body).map_err(|e| CodecError::Decode(format!("{:?}", e)))
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Encode,
{
    let bytes = encode_frame(frame)?;
    trace!("-> frame {}", hex::encode(&bytes));
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
where
    R: AsyncRead + Unpin,
    T: Decode,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(CodecError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CodecError::Truncated,
        _ => CodecError::Io(e),
    })?;
    trace!("<- frame {}", hex::encode(&body));

    decode_frame(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BrokerFrame, ClientFrame};

    #[test]
    fn test_encode_frame_prefix() {
        let frame = ClientFrame::increase_credits(7, 3);
        let bytes = encode_frame(&frame).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
    }

    #[test]
    fn test_read_frame_clean_eof() {
        let mut empty: &[u8] = &[];
        let frame: Option<ClientFrame> = tokio_test::block_on(read_frame(&mut empty)).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn test_read_frame_truncated_prefix() {
        let mut partial: &[u8] = &[0, 0];
        let result: Result<Option<ClientFrame>, _> = tokio_test::block_on(read_frame(&mut partial));
        assert!(matches!(result, Err(CodecError::Truncated)));
    }

    #[test]
    fn test_read_frame_truncated_body() {
        let bytes = encode_frame(&BrokerFrame::subscription_opened(9)).unwrap();
        let mut cut: &[u8] = &bytes[..bytes.len() - 1];
        let result: Result<Option<BrokerFrame>, _> = tokio_test::block_on(read_frame(&mut cut));
        assert!(matches!(result, Err(CodecError::Truncated)));
    }

    #[test]
    fn test_read_frame_rejects_oversized_length() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut reader: &[u8] = &len;
        let result: Result<Option<BrokerFrame>, _> = tokio_test::block_on(read_frame(&mut reader));
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }
}
