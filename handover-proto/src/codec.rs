//! Length-prefixed frame codec.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`. The blocking
//! pair ([`encode`] / [`decode`]) works over any `Read`/`Write` stream; the
//! async pair ([`send`] / [`recv`]) over tokio streams.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Serializes `msg` and prepends its length.
fn frame(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    let mut buf = Vec::with_capacity(payload.len() + 4);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Validates a frame header.
fn frame_len(header: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    Ok(len as usize)
}

/// Decodes a frame payload.
fn unframe<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> io::Result<T> {
    postcard::from_bytes(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Encodes `msg` as a length-prefixed postcard frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    w.write_all(&frame(msg)?)?;
    w.flush()
}

/// Reads a length-prefixed postcard frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let mut payload = vec![0u8; frame_len(header)?];
    r.read_exact(&mut payload)?;
    unframe(&payload)
}

/// Async counterpart of [`encode`]. Flushes after the frame.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    w.write_all(&frame(msg)?).await?;
    w.flush().await
}

/// Async counterpart of [`decode`].
pub async fn recv<T: for<'de> Deserialize<'de>>(
    r: &mut (impl AsyncRead + Unpin),
) -> io::Result<T> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let mut payload = vec![0u8; frame_len(header)?];
    r.read_exact(&mut payload).await?;
    unframe(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, Envelope};

    #[test]
    fn roundtrip_start_payload() {
        let env = Envelope::new(42, Command::Start(br#"{"web":{"0.0.0.0:80":"tcp#3"}}"#.to_vec()));

        let mut buf = Vec::new();
        encode(&mut buf, &env).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let decoded: Envelope = decode(&mut cursor).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn header_is_big_endian_length() {
        let mut buf = Vec::new();
        encode(&mut buf, &Envelope::new(1, Command::Reload)).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[test]
    fn rejects_oversized_frame() {
        // Craft a frame header claiming 32 MiB
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        let mut cursor = io::Cursor::new(&header[..]);
        let result: io::Result<Envelope> = decode(&mut cursor);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_eof() {
        let mut buf = Vec::new();
        encode(&mut buf, &Envelope::new(7, Command::Shutdown)).unwrap();
        buf.truncate(buf.len() - 1);
        let mut cursor = io::Cursor::new(&buf);
        let result: io::Result<Envelope> = decode(&mut cursor);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn async_codec_interoperates_with_blocking() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send(&mut a, &Envelope::new(9, Command::Close)).await.unwrap();
        let got: Envelope = recv(&mut b).await.unwrap();
        assert_eq!(got, Envelope::new(9, Command::Close));

        let mut buf = Vec::new();
        encode(&mut buf, &Envelope::new(3, Command::Heartbeat)).unwrap();
        let mut slice = &buf[..];
        let got: Envelope = recv(&mut slice).await.unwrap();
        assert_eq!(got.command, Command::Heartbeat);
    }
}
