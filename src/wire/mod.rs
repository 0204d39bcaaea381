//! The request/response wire protocol.
//!
//! Every exchange is initiated by a single request byte, answered by a
//! single response byte, with any payload (a length-prefixed string, a
//! directory manifest, a file body) belonging to that exchange. Structured
//! receives consume exactly the bytes each record requires and fail with a
//! protocol error on a short read; sends are staged and flushed in batches
//! of at most [`MAX_SENDSIZE`] bytes per write call.

pub mod primitive;

#[cfg(test)]
mod tests;

use std::io::Cursor;
use std::path::PathBuf;
use std::string::FromUtf8Error;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::entry::{Entry, FileKind};
use crate::listing::Listing;
use crate::{MAX_DIRNAME, MAX_SENDSIZE, MAX_TRANSFER};

/// Result of wire operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the codec. All of them are fatal to the session.
#[derive(Debug)]
pub enum Error {
    /// Transport failure, including EOF inside a structured read.
    Io(std::io::Error),
    /// A length prefix exceeded the allowed maximum.
    StringOverflow { length: usize, limit: usize },
    /// An unknown request byte.
    BadOpcode(u8),
    /// An unknown response byte.
    BadResponse(u8),
    /// A received name that is not valid UTF-8.
    BadString(FromUtf8Error),
}

/// Request opcodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Request {
    /// Fetch a file body. A name follows.
    File = b'F',
    /// Enter a directory. A name follows.
    Goto = b'G',
    /// Leave the current directory, or end the session at top level.
    Quit = b'Q',
    /// Exchange capability vectors.
    Version = b'V',
    /// Report the working directory.
    Cwd = b'P',
}

/// Response codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Response {
    /// Operation accepted.
    Yes = b'Y',
    /// Operation refused.
    No = b'N',
}

/// Fixed-size portion of an entry on the wire: size, info, mtime and
/// checksum, 8 bytes each.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryDesc {
    pub size: u64,
    pub info: u64,
    pub mtime: i64,
    pub ksum: u64,
}

impl EntryDesc {
    pub fn of(entry: &Entry) -> EntryDesc {
        EntryDesc {
            size: entry.size,
            info: entry.info,
            mtime: entry.mtime,
            ksum: entry.ksum,
        }
    }
}

/// A framed connection over any async byte stream.
pub struct Connection<S> {
    stream: S,
    sendbuf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Connection<S> {
        Connection {
            stream,
            sendbuf: Vec::new(),
        }
    }

    /// Reads exactly `buf.len()` bytes from the transport.
    async fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).await.map_err(Error::Io)?;
        tracing::trace!(bytes = buf.len(), "recv");
        Ok(())
    }

    /// Flushes the staged bytes, splitting them over sends of at most
    /// [`MAX_SENDSIZE`] bytes each.
    async fn flush(&mut self) -> Result<()> {
        for chunk in self.sendbuf.chunks(MAX_SENDSIZE) {
            self.stream.write_all(chunk).await.map_err(Error::Io)?;
        }
        tracing::trace!(bytes = self.sendbuf.len(), "send");
        self.sendbuf.clear();
        self.stream.flush().await.map_err(Error::Io)
    }

    pub async fn send_request(&mut self, request: Request) -> Result<()> {
        self.sendbuf.push(request as u8);
        self.flush().await
    }

    pub async fn recv_request(&mut self) -> Result<Request> {
        let mut byte = [0u8; 1];
        self.fill(&mut byte).await?;
        Request::from_u8(byte[0]).ok_or(Error::BadOpcode(byte[0]))
    }

    pub async fn send_response(&mut self, response: Response) -> Result<()> {
        self.sendbuf.push(response as u8);
        self.flush().await
    }

    pub async fn recv_response(&mut self) -> Result<Response> {
        let mut byte = [0u8; 1];
        self.fill(&mut byte).await?;
        Response::from_u8(byte[0]).ok_or(Error::BadResponse(byte[0]))
    }

    /// Sends a length-prefixed byte string.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        primitive::put_bytes(&mut self.sendbuf, bytes)?;
        self.flush().await
    }

    /// Sends a length-prefixed string.
    pub async fn send_string(&mut self, string: &str) -> Result<()> {
        self.send_bytes(string.as_bytes()).await
    }

    /// Receives a length-prefixed byte string of fewer than `limit` bytes.
    pub async fn recv_bytes(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut prefix = [0u8; 2];
        self.fill(&mut prefix).await?;
        let length = u16::from_be_bytes(prefix) as usize;
        if length >= limit {
            return Err(Error::StringOverflow { length, limit });
        }
        let mut vec = vec![0u8; length];
        self.fill(vec.as_mut_slice()).await?;
        Ok(vec)
    }

    /// Receives a length-prefixed UTF-8 string of fewer than `limit`
    /// bytes.
    pub async fn recv_string(&mut self, limit: usize) -> Result<String> {
        String::from_utf8(self.recv_bytes(limit).await?).map_err(Error::BadString)
    }

    /// Sends a directory manifest: the entry count followed by each
    /// entry's descriptor, name and, for symlinks, target.
    pub async fn send_listing(&mut self, listing: &Listing) -> Result<()> {
        let count = u32::try_from(listing.entries.len()).map_err(|_| Error::StringOverflow {
            length: listing.entries.len(),
            limit: u32::MAX as usize,
        })?;
        primitive::put_u32(&mut self.sendbuf, count)?;

        for entry in &listing.entries {
            primitive::put_entry_desc(&mut self.sendbuf, &EntryDesc::of(entry))?;
            primitive::put_bytes(&mut self.sendbuf, entry.name.as_bytes())?;
            if entry.kind() == FileKind::Symlink {
                primitive::put_bytes(&mut self.sendbuf, entry.link_target.as_bytes())?;
            }
            if self.sendbuf.len() >= MAX_TRANSFER {
                self.flush().await?;
            }
        }

        self.flush().await
    }

    /// Receives a directory manifest into a listing carrying the local
    /// `path` it corresponds to.
    pub async fn recv_listing(&mut self, path: PathBuf) -> Result<Listing> {
        let mut prefix = [0u8; 4];
        self.fill(&mut prefix).await?;
        let count = u32::from_be_bytes(prefix);

        let mut listing = Listing::new(path);
        for _ in 0..count {
            let mut raw = [0u8; 32];
            self.fill(&mut raw).await?;
            let desc = primitive::get_entry_desc(&mut Cursor::new(&raw[..]))?;

            let name = self.recv_string(MAX_DIRNAME).await?;
            let link_target = if FileKind::from_info(desc.info) == FileKind::Symlink {
                self.recv_string(MAX_DIRNAME).await?
            } else {
                String::new()
            };

            listing.entries.push(Entry {
                name,
                info: desc.info,
                size: desc.size,
                mtime: desc.mtime,
                ksum: desc.ksum,
                link_target,
                children: None,
            });
        }

        Ok(listing)
    }

    /// Sends one chunk of a file body.
    pub async fn send_body(&mut self, chunk: &[u8]) -> Result<()> {
        for piece in chunk.chunks(MAX_SENDSIZE) {
            self.stream.write_all(piece).await.map_err(Error::Io)?;
        }
        tracing::trace!(bytes = chunk.len(), "send body");
        self.stream.flush().await.map_err(Error::Io)
    }

    /// Receives exactly `buf.len()` bytes of a file body.
    pub async fn recv_body(&mut self, buf: &mut [u8]) -> Result<()> {
        self.fill(buf).await
    }
}
