//! Framing codec
//!
//! Big-endian integers, 16-bit length-prefixed strings, and chunked byte
//! streams: `(u16 len, bytes)*` closed by a zero-length chunk.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use thiserror::Error;

use crate::error::CodecError;
use crate::protocol::pace::TransferPace;

/// Largest payload a single chunk or string can carry.
pub const MAX_CHUNK: usize = u16::MAX as usize;

const COPY_BUFFER: usize = 32 * 1024;

/// Failure while moving a chunk stream between the peer and a local file.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The peer side failed; the stream position is unknown.
    #[error(transparent)]
    Peer(#[from] CodecError),
    /// The local side failed; the chunk stream itself is still in sync.
    #[error("local I/O: {0}")]
    Local(io::Error),
}

async fn timed<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, CodecError> {
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CodecError::TimedOut(what)),
    }
}

/// Decoding half of a connection.
pub struct WireReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub async fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.inner.read_u8().await?)
    }

    pub async fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.inner.read_u16().await?)
    }

    pub async fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.inner.read_u32().await?)
    }

    pub async fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(self.inner.read_u64().await?)
    }

    pub async fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.inner.read_i32().await?)
    }

    pub async fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.inner.read_i64().await?)
    }

    /// Reads a length-prefixed byte string.
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.inner.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads a length-prefixed UTF-8 string of at most `max` bytes. The whole
    /// string is consumed even when it is rejected.
    pub async fn read_string(&mut self, max: usize) -> Result<String, CodecError> {
        let bytes = self.read_bytes().await?;
        decode_text(bytes, max)
    }

    /// Reads one chunk; `None` is the terminator.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let bytes = self.read_bytes().await?;
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    /// Copies a chunk stream into `dst` up to and including its terminator.
    ///
    /// If `dst` fails, the remaining chunks are still read and discarded so
    /// the next message starts at the right offset.
    pub async fn read_chunked_into<W: AsyncWrite + Unpin>(
        &mut self,
        dst: &mut W,
        pace: &TransferPace,
    ) -> Result<u64, ChunkError> {
        let mut buf = Vec::new();
        let mut total = 0u64;
        let mut local_error: Option<io::Error> = None;

        loop {
            let len = timed(pace.base(), "reading chunk length", self.inner.read_u16()).await?;
            if len == 0 {
                break;
            }

            buf.resize(len as usize, 0);
            timed(
                pace.deadline_for(u64::from(len)),
                "reading chunk data",
                self.inner.read_exact(&mut buf),
            )
            .await?;

            if local_error.is_none() {
                match dst.write_all(&buf).await {
                    Ok(()) => total += u64::from(len),
                    Err(e) => local_error = Some(e),
                }
            }
        }

        if local_error.is_none() {
            if let Err(e) = dst.flush().await {
                local_error = Some(e);
            }
        }

        match local_error {
            Some(e) => Err(ChunkError::Local(e)),
            None => Ok(total),
        }
    }
}

/// Validates a raw wire string against a soft length limit.
pub fn decode_text(bytes: Vec<u8>, max: usize) -> Result<String, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::StringTooLong {
            len: bytes.len(),
            max,
        });
    }
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

/// Encoding half of a connection.
pub struct WireWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        Ok(self.inner.write_u8(value).await?)
    }

    pub async fn write_u16(&mut self, value: u16) -> Result<(), CodecError> {
        Ok(self.inner.write_u16(value).await?)
    }

    pub async fn write_u32(&mut self, value: u32) -> Result<(), CodecError> {
        Ok(self.inner.write_u32(value).await?)
    }

    pub async fn write_u64(&mut self, value: u64) -> Result<(), CodecError> {
        Ok(self.inner.write_u64(value).await?)
    }

    pub async fn write_i32(&mut self, value: i32) -> Result<(), CodecError> {
        Ok(self.inner.write_i32(value).await?)
    }

    pub async fn write_i64(&mut self, value: i64) -> Result<(), CodecError> {
        Ok(self.inner.write_i64(value).await?)
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.len() > MAX_CHUNK {
            return Err(CodecError::StringTooLong {
                len: bytes.len(),
                max: MAX_CHUNK,
            });
        }
        self.inner.write_u16(bytes.len() as u16).await?;
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_string(&mut self, text: &str) -> Result<(), CodecError> {
        self.write_bytes(text.as_bytes()).await
    }

    pub async fn write_terminator(&mut self) -> Result<(), CodecError> {
        self.write_u16(0).await
    }

    /// Streams `src` to the peer as chunks followed by the terminator. The
    /// terminator is written even when `src` fails part way.
    pub async fn write_chunked_from<S: AsyncRead + Unpin>(
        &mut self,
        src: &mut S,
    ) -> Result<u64, ChunkError> {
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut total = 0u64;

        loop {
            let n = match src.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    self.write_terminator().await?;
                    return Err(ChunkError::Local(e));
                }
            };
            self.write_bytes(&buf[..n]).await?;
            total += n as u64;
        }

        self.write_terminator().await?;
        Ok(total)
    }

    pub async fn flush(&mut self) -> Result<(), CodecError> {
        Ok(self.inner.flush().await?)
    }
}
