//! Spooled byte buffers.
//!
//! Request bodies and git output are unbounded, so both sides of the RPC
//! exchange go through a [`Spooled`] buffer: bytes accumulate in memory up
//! to the configured threshold and spill to an anonymous temporary file
//! beyond it. Anonymous files are unlinked at creation, so they disappear
//! on every exit path, panics included.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};

use futures_util::Stream;
use tokio::io::{AsyncRead, ReadBuf};

/// A write-once buffer that spills from memory to disk past `limit` bytes.
pub struct Spooled {
    limit: usize,
    inner: Buffer,
}

enum Buffer {
    Memory(Vec<u8>),
    Disk(File),
}

impl Spooled {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Buffer::Memory(Vec::new()),
        }
    }

    pub fn len(&self) -> io::Result<u64> {
        match &self.inner {
            Buffer::Memory(buf) => Ok(buf.len() as u64),
            Buffer::Disk(file) => Ok(file.metadata()?.len()),
        }
    }

    #[cfg(test)]
    pub fn on_disk(&self) -> bool {
        matches!(self.inner, Buffer::Disk(_))
    }

    fn spill(&mut self) -> io::Result<()> {
        if let Buffer::Memory(buf) = &mut self.inner {
            let mut file = tempfile::tempfile()?;
            file.write_all(buf)?;
            self.inner = Buffer::Disk(file);
        }
        Ok(())
    }

    /// Consume the buffer into a chunked read stream, suitable for an HTTP
    /// response body.
    pub fn into_stream(self, chunk_sz: usize) -> io::Result<SpoolStream> {
        match self.inner {
            Buffer::Memory(buf) => Ok(SpoolStream::Bytes(buf)),
            Buffer::Disk(mut file) => {
                file.rewind()?;
                Ok(SpoolStream::File(FileStream::new(file, chunk_sz)))
            }
        }
    }

    /// Consume the buffer into an async reader, suitable for feeding a
    /// subprocess stdin.
    pub fn into_reader(self) -> io::Result<SpoolReader> {
        match self.inner {
            Buffer::Memory(buf) => Ok(SpoolReader::Memory(Cursor::new(buf))),
            Buffer::Disk(mut file) => {
                file.rewind()?;
                Ok(SpoolReader::Disk(tokio::fs::File::from_std(file)))
            }
        }
    }
}

impl Write for Spooled {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Buffer::Memory(mem) = &self.inner {
            if mem.len() + buf.len() > self.limit {
                self.spill()?;
            }
        }
        match &mut self.inner {
            Buffer::Memory(mem) => {
                mem.extend_from_slice(buf);
                Ok(buf.len())
            }
            Buffer::Disk(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Buffer::Memory(_) => Ok(()),
            Buffer::Disk(file) => file.flush(),
        }
    }
}

/// An enum to support both one-shot memory and file-backed streaming.
pub enum SpoolStream {
    Bytes(Vec<u8>),
    File(FileStream),
}

impl Stream for SpoolStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = Pin::into_inner(self);

        match me {
            SpoolStream::Bytes(v) => {
                if v.is_empty() {
                    Poll::Ready(None)
                } else {
                    let drain: Vec<_> = v.drain(..).collect();
                    Poll::Ready(Some(Ok(drain)))
                }
            }
            SpoolStream::File(s) => Pin::new(s).poll_next(cx),
        }
    }
}

/// A chunked read stream over a file.
pub struct FileStream {
    file: File,
    chunk_sz: usize,
}

impl FileStream {
    pub fn new(file: File, chunk_sz: usize) -> Self {
        Self { file, chunk_sz }
    }
}

impl Stream for FileStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = Pin::into_inner(self);
        let mut buf = vec![0u8; me.chunk_sz];

        match me.file.read(&mut buf) {
            Ok(sz) => {
                if sz > 0 {
                    buf.truncate(sz);
                    Poll::Ready(Some(Ok(buf)))
                } else {
                    Poll::Ready(None)
                }
            }
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}

/// The read-back side of a [`Spooled`] buffer.
pub enum SpoolReader {
    Memory(Cursor<Vec<u8>>),
    Disk(tokio::fs::File),
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::into_inner(self) {
            SpoolReader::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            SpoolReader::Disk(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}
