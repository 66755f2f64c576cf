//! Length-prefixed frame codec
//!
//! Every frame is laid out as:
//!
//! ```text
//! +--------+----------------+------------------+
//! | tag u8 | length u32 BE  | body (bincode)   |
//! +--------+----------------+------------------+
//! ```
//!
//! Readers and writers take a buffer from the global [`BufferPool`] on first
//! use and hand it back on [`FramingReader::recycle`] / [`FramingWriter::recycle`]
//! or when dropped. Any decoding failure is fatal to the underlying
//! connection; there is no frame-level retry.

use crate::pool::{BufferPool, PooledBuf};
use crate::MAX_FRAME_SIZE;
use bytes::BufMut;
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Size of the tag + length header
pub const HEADER_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Truncated frame")]
    Truncated,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Reads tagged frames from a byte stream
#[derive(Debug)]
pub struct FramingReader<R> {
    inner: BufReader<R>,
    buf: Option<PooledBuf>,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FramingReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Read the next frame, returning its tag and raw body
    pub async fn read_frame(&mut self) -> Result<(u8, &[u8]), CodecError> {
        let tag = match self.inner.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(CodecError::Closed),
            Err(e) => return Err(e.into()),
        };

        let len = self.inner.read_u32().await.map_err(truncated)?;
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(len as usize));
        }

        let buf = self
            .buf
            .get_or_insert_with(|| BufferPool::global().acquire());
        buf.clear();
        buf.resize(len as usize, 0);
        self.inner.read_exact(&mut buf[..]).await.map_err(truncated)?;

        Ok((tag, &buf[..]))
    }

    /// Read the next frame and decode its body as `T`
    ///
    /// Returns the frame tag, the body length and the decoded message.
    pub async fn read_marshal<T: DeserializeOwned>(&mut self) -> Result<(u8, usize, T), CodecError> {
        let (tag, body) = self.read_frame().await?;
        let size = body.len();
        let msg = bincode::deserialize(body).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok((tag, size, msg))
    }

    /// Release the frame buffer back to the pool
    ///
    /// The reader stays usable; a new buffer is taken on the next read.
    pub fn recycle(&mut self) {
        self.buf = None;
    }

    /// Give up framing and return the buffered reader
    ///
    /// Bytes already read ahead from the source stay in the returned reader.
    pub fn into_inner(self) -> BufReader<R> {
        self.inner
    }
}

/// Writes tagged frames to a byte stream
#[derive(Debug)]
pub struct FramingWriter<W> {
    inner: W,
    buf: Option<PooledBuf>,
    max_frame_size: u32,
}

impl<W: AsyncWrite + Unpin> FramingWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: writer,
            buf: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Write one frame with a raw body; returns the body length
    pub async fn write_frame(&mut self, tag: u8, body: &[u8]) -> Result<usize, CodecError> {
        if body.len() > self.max_frame_size as usize {
            return Err(CodecError::FrameTooLarge(body.len()));
        }

        let buf = self
            .buf
            .get_or_insert_with(|| BufferPool::global().acquire());
        buf.clear();
        buf.put_u8(tag);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        self.inner.write_all(&buf[..]).await?;
        self.inner.flush().await?;

        Ok(body.len())
    }

    /// Encode `msg` and write it as one frame; returns the body length
    pub async fn write_marshal<T: Serialize>(&mut self, tag: u8, msg: &T) -> Result<usize, CodecError> {
        let buf = self
            .buf
            .get_or_insert_with(|| BufferPool::global().acquire());
        buf.clear();
        buf.put_u8(tag);
        buf.put_u32(0);
        bincode::serialize_into((&mut **buf).writer(), msg)
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        let len = buf.len() - HEADER_SIZE;
        if len > self.max_frame_size as usize {
            return Err(CodecError::FrameTooLarge(len));
        }
        buf[1..HEADER_SIZE].copy_from_slice(&(len as u32).to_be_bytes());

        self.inner.write_all(&buf[..]).await?;
        self.inner.flush().await?;

        Ok(len)
    }

    /// Release the frame buffer back to the pool
    pub fn recycle(&mut self) {
        self.buf = None;
    }

    /// Shut down the write side of the underlying stream
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn truncated(e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(e)
    }
}
