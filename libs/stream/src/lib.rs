// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Streams: a small, composable byte-pipe abstraction in the spirit of a
//! filter chain. Every stream advertises which operations it supports via
//! [`Caps`]; callers that need a capability check it rather than
//! discovering it via a failed call. Operations gated on a capability the
//! stream doesn't advertise default to `Err(Error::NotPermitted)`.

mod buffer;
mod buffered;
mod pipe;

pub use buffer::Buffer;
pub use buffered::{BufferedStream, Config};
pub use pipe::{PipeEndpoint, pipe};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u8 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const SEEK = 0b0000_0100;
        const SIZE = 0b0000_1000;
        const TRUNCATE = 0b0001_0000;
        const FIND = 0b0010_0000;
        const UNREAD = 0b0100_0000;
        const CANCEL = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDirection {
    Read,
    Write,
    Both,
}

/// Reference point for [`Stream::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekAnchor {
    Begin,
    Current,
    End,
}

/// Result of [`Stream::find`]: either the delimiter was found, or it wasn't
/// and the caller learns how many bytes are sitting in the read-ahead buffer
/// so it can decide whether to keep waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindOutcome {
    /// Everything up to and including the delimiter.
    Found(Vec<u8>),
    /// The delimiter hasn't appeared yet; this many bytes are buffered.
    NotFound { buffered: usize },
}

/// Errors shared by every stream and, by extension, by the reactor and
/// timer crates that surface stream-shaped failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation aborted")]
    OperationAborted,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("buffer overflow")]
    BufferOverflow,
    #[error("write beyond eof")]
    WriteBeyondEof,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation not permitted")]
    NotPermitted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Stream: Send {
    fn caps(&self) -> Caps;

    /// Reads at most `len` bytes. An empty result means end-of-stream.
    fn read(&mut self, len: usize) -> Result<Vec<u8>, Error>;

    /// Writes as much of `data` as the stream can currently accept, returning
    /// the number of bytes actually written. Callers loop until all of
    /// `data` is consumed.
    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    fn close(&mut self, direction: CloseDirection) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Repositions the stream, returning the new absolute offset. Gated on
    /// [`Caps::SEEK`].
    fn seek(&mut self, _offset: i64, _anchor: SeekAnchor) -> Result<u64, Error> {
        Err(Error::NotPermitted)
    }

    /// Current length in bytes. Gated on [`Caps::SIZE`].
    fn size(&self) -> Result<u64, Error> {
        Err(Error::NotPermitted)
    }

    /// Truncates (or extends) the stream to `len` bytes. Gated on
    /// [`Caps::TRUNCATE`].
    fn truncate(&mut self, _len: u64) -> Result<(), Error> {
        Err(Error::NotPermitted)
    }

    /// Causes the current or next `read` to fail with
    /// [`Error::OperationAborted`], without disturbing any buffered data.
    /// Sticky until the stream is reset by closing. Safe to call from a
    /// different fiber or thread than the one suspended in `read`. A no-op
    /// by default; streams that can actually suspend a reader override it.
    fn cancel_read(&self) {}

    /// Write-side counterpart of [`Stream::cancel_read`].
    fn cancel_write(&self) {}

    /// Scans for `needle`, pulling from the underlying source as needed up
    /// to `sanity_bound` total buffered bytes. If the bound is hit, or the
    /// source reaches EOF, first without finding `needle`: raises
    /// [`Error::BufferOverflow`] (bound hit) or [`Error::UnexpectedEof`]
    /// (EOF) when `throw_if_missing` is set, otherwise returns
    /// [`FindOutcome::NotFound`]. Gated on [`Caps::FIND`].
    fn find(
        &mut self,
        _needle: &[u8],
        _sanity_bound: usize,
        _throw_if_missing: bool,
    ) -> Result<FindOutcome, Error> {
        Err(Error::NotPermitted)
    }

    /// Pushes `bytes` back so the next `read` returns them first. Gated on
    /// [`Caps::UNREAD`].
    fn unread(&mut self, _bytes: &[u8]) -> Result<(), Error> {
        Err(Error::NotPermitted)
    }
}
