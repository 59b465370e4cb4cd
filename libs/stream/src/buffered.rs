// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wraps a [`Stream`] with a read-ahead buffer and a write-coalescing
//! buffer, so callers can scan for a delimiter that may straddle two
//! underlying reads, and so small writes aren't forwarded to the parent one
//! at a time.

use crate::{Buffer, Caps, CloseDirection, Error, FindOutcome, SeekAnchor, Stream};

/// Tunables for a [`BufferedStream`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Size, in bytes, of both the read-ahead fill and the write-coalescing
    /// chunk.
    pub buf_size: usize,
    /// When `true` (the default), `read` may return fewer bytes than
    /// requested as soon as at least one parent read has happened. When
    /// `false`, `read` keeps pulling from the parent until either the full
    /// length is satisfied or the parent hits EOF.
    pub allow_partial_reads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buf_size: 65_536,
            allow_partial_reads: true,
        }
    }
}

pub struct BufferedStream {
    inner: Box<dyn Stream>,
    read_buf: Buffer,
    write_buf: Buffer,
    buf_size: usize,
    allow_partial_reads: bool,
    at_eof: bool,
}

impl BufferedStream {
    pub fn new(inner: Box<dyn Stream>, config: &Config) -> Self {
        Self {
            inner,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            buf_size: config.buf_size.max(1),
            allow_partial_reads: config.allow_partial_reads,
            at_eof: false,
        }
    }

    fn fill(&mut self, want: usize) -> Result<(), Error> {
        let chunk = self.inner.read(want)?;
        if chunk.is_empty() {
            self.at_eof = true;
        } else {
            self.read_buf.extend(&chunk);
        }
        Ok(())
    }

    /// Flushes full `buf_size` chunks of `write_buf` to the parent.
    /// `rewind_len` and `before_len` bracket the data this particular
    /// `write` call appended: if the parent fails before any of it has
    /// reached the parent (`write_buf.len()` still `before_len`), the
    /// appended bytes are rewound and the error propagated; if the parent
    /// has already accepted part of this call's data, the error is
    /// swallowed — the caller can't be told their write half-succeeded, and
    /// the next operation will re-fail against the same parent.
    fn flush_full_chunks(&mut self, rewind_len: usize, before_len: usize) -> Result<(), Error> {
        while self.write_buf.len() >= self.buf_size {
            let chunk = self.write_buf.peek(self.buf_size);
            match self.inner.write(&chunk) {
                Ok(n) => {
                    self.write_buf.consume(n);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(err) => {
                    if self.write_buf.len() == before_len {
                        self.write_buf.truncate(rewind_len);
                        return Err(err);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drains `write_buf` completely, regardless of `buf_size`, used before
    /// an operation (seek, truncate, close) that needs the parent's view to
    /// be up to date.
    fn flush_all(&mut self) -> Result<(), Error> {
        while !self.write_buf.is_empty() {
            let chunk = self.write_buf.peek(self.write_buf.len());
            let n = self.inner.write(&chunk)?;
            if n == 0 {
                return Err(Error::BrokenPipe);
            }
            self.write_buf.consume(n);
        }
        Ok(())
    }
}

impl Stream for BufferedStream {
    fn caps(&self) -> Caps {
        self.inner.caps() | Caps::FIND | Caps::UNREAD
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if self.read_buf.len() < len && !self.at_eof {
            let need = len - self.read_buf.len();
            let rounded = need.max(self.buf_size).div_ceil(self.buf_size) * self.buf_size;
            self.fill(rounded)?;
            while !self.allow_partial_reads && self.read_buf.len() < len && !self.at_eof {
                self.fill(self.buf_size)?;
            }
        }
        Ok(self.read_buf.consume(len))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let rewind_len = self.write_buf.len();
        self.write_buf.extend(data);
        let before_len = self.write_buf.len();
        self.flush_full_chunks(rewind_len, before_len)?;
        Ok(data.len())
    }

    fn close(&mut self, direction: CloseDirection) -> Result<(), Error> {
        if matches!(direction, CloseDirection::Write | CloseDirection::Both) {
            self.flush_all()?;
        }
        self.inner.close(direction)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.flush_all()?;
        self.inner.flush()
    }

    fn seek(&mut self, offset: i64, anchor: SeekAnchor) -> Result<u64, Error> {
        assert!(
            self.read_buf.is_empty() || self.write_buf.is_empty(),
            "seeking a BufferedStream requires one of its buffers to be empty"
        );
        self.flush_all()?;
        self.read_buf = Buffer::new();
        self.at_eof = false;
        self.inner.seek(offset, anchor)
    }

    fn size(&self) -> Result<u64, Error> {
        self.inner.size()
    }

    fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.flush_all()?;
        self.inner.truncate(len)
    }

    fn cancel_read(&self) {
        self.inner.cancel_read();
    }

    fn cancel_write(&self) {
        self.inner.cancel_write();
    }

    /// Reads from the inner stream until `needle` is found, the sanity
    /// bound is hit, or the stream ends, returning everything up to and
    /// including `needle`. The search resumes from where it left off
    /// across calls, so a delimiter split across two underlying reads is
    /// still found.
    fn find(
        &mut self,
        needle: &[u8],
        sanity_bound: usize,
        throw_if_missing: bool,
    ) -> Result<FindOutcome, Error> {
        loop {
            if let Some(pos) = self.read_buf.find(needle) {
                let out = self.read_buf.consume(pos + needle.len());
                return Ok(FindOutcome::Found(out));
            }
            if self.read_buf.len() >= sanity_bound {
                return if throw_if_missing {
                    Err(Error::BufferOverflow)
                } else {
                    Ok(FindOutcome::NotFound {
                        buffered: self.read_buf.len(),
                    })
                };
            }
            if self.at_eof {
                return if throw_if_missing {
                    Err(Error::UnexpectedEof)
                } else {
                    Ok(FindOutcome::NotFound {
                        buffered: self.read_buf.len(),
                    })
                };
            }
            self.fill(self.buf_size)?;
        }
    }

    /// Puts bytes back at the front of the read-ahead buffer.
    fn unread(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.read_buf.prepend(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChunkedStream {
        chunks: Vec<Vec<u8>>,
    }

    impl Stream for ChunkedStream {
        fn caps(&self) -> Caps {
            Caps::READ
        }

        fn read(&mut self, _len: usize) -> Result<Vec<u8>, Error> {
            if self.chunks.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.chunks.remove(0))
            }
        }

        fn write(&mut self, _data: &[u8]) -> Result<usize, Error> {
            Err(Error::NotPermitted)
        }

        fn close(&mut self, _direction: CloseDirection) -> Result<(), Error> {
            Ok(())
        }
    }

    /// A stream that never produces `needle` and never EOFs, to exercise
    /// `find`'s sanity bound.
    struct EndlessStream;

    impl Stream for EndlessStream {
        fn caps(&self) -> Caps {
            Caps::READ
        }

        fn read(&mut self, len: usize) -> Result<Vec<u8>, Error> {
            Ok(vec![b'x'; len.max(1)])
        }

        fn write(&mut self, _data: &[u8]) -> Result<usize, Error> {
            Err(Error::NotPermitted)
        }

        fn close(&mut self, _direction: CloseDirection) -> Result<(), Error> {
            Ok(())
        }
    }

    /// A stream whose `write` always fails, to exercise rewind-on-failure.
    struct FailingStream;

    impl Stream for FailingStream {
        fn caps(&self) -> Caps {
            Caps::WRITE
        }

        fn read(&mut self, _len: usize) -> Result<Vec<u8>, Error> {
            Err(Error::NotPermitted)
        }

        fn write(&mut self, _data: &[u8]) -> Result<usize, Error> {
            Err(Error::BrokenPipe)
        }

        fn close(&mut self, _direction: CloseDirection) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn finds_delimiter_split_across_reads() {
        let inner = ChunkedStream {
            chunks: vec![b"abc\r".to_vec(), b"\nxyz".to_vec()],
        };
        let mut buffered = BufferedStream::new(Box::new(inner), &Config::default());
        let line = buffered.find(b"\r\n", 1024, true).unwrap();
        assert_eq!(line, FindOutcome::Found(b"abc\r\n".to_vec()));
        let rest = buffered.read(3).unwrap();
        assert_eq!(rest, b"xyz");
    }

    #[test]
    fn find_raises_buffer_overflow_past_sanity_bound() {
        let mut buffered = BufferedStream::new(
            Box::new(EndlessStream),
            &Config {
                buf_size: 16,
                allow_partial_reads: true,
            },
        );
        let err = buffered.find(b"\r\n", 32, true).unwrap_err();
        assert!(matches!(err, Error::BufferOverflow));
    }

    #[test]
    fn find_returns_not_found_past_sanity_bound_without_throw_if_missing() {
        let mut buffered = BufferedStream::new(
            Box::new(EndlessStream),
            &Config {
                buf_size: 16,
                allow_partial_reads: true,
            },
        );
        let outcome = buffered.find(b"\r\n", 32, false).unwrap();
        match outcome {
            FindOutcome::NotFound { buffered } => assert!(buffered >= 32),
            FindOutcome::Found(_) => panic!("delimiter does not appear in EndlessStream's output"),
        }
    }

    #[test]
    fn find_raises_unexpected_eof_when_delimiter_never_arrives() {
        let inner = ChunkedStream {
            chunks: vec![b"abc".to_vec()],
        };
        let mut buffered = BufferedStream::new(Box::new(inner), &Config::default());
        let err = buffered.find(b"\r\n", 1024, true).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
    }

    #[test]
    fn write_coalesces_into_buf_size_chunks() {
        struct CountingStream {
            writes: Vec<usize>,
        }
        impl Stream for CountingStream {
            fn caps(&self) -> Caps {
                Caps::WRITE
            }
            fn read(&mut self, _len: usize) -> Result<Vec<u8>, Error> {
                Err(Error::NotPermitted)
            }
            fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
                self.writes.push(data.len());
                Ok(data.len())
            }
            fn close(&mut self, _direction: CloseDirection) -> Result<(), Error> {
                Ok(())
            }
        }

        let inner = CountingStream { writes: Vec::new() };
        let mut buffered = BufferedStream::new(
            Box::new(inner),
            &Config {
                buf_size: 4,
                allow_partial_reads: true,
            },
        );
        assert_eq!(buffered.write(b"ab").unwrap(), 2);
        assert_eq!(buffered.write(b"cdef").unwrap(), 4);
        // "ab" + "cdef" = 6 bytes, one full 4-byte chunk flushed, 2 left buffered.
        buffered.flush().unwrap();
    }

    #[test]
    fn write_rewinds_the_buffer_when_nothing_reached_the_parent() {
        let mut buffered = BufferedStream::new(
            Box::new(FailingStream),
            &Config {
                buf_size: 4,
                allow_partial_reads: true,
            },
        );
        let err = buffered.write(b"abcd").unwrap_err();
        assert!(matches!(err, Error::BrokenPipe));
        // the failed write must not have left anything behind to re-flush
        // silently on the next call.
        assert_eq!(buffered.write_buf.len(), 0);
    }

    #[test]
    fn unread_is_returned_before_the_next_read() {
        let inner = ChunkedStream {
            chunks: vec![b"world".to_vec()],
        };
        let mut buffered = BufferedStream::new(Box::new(inner), &Config::default());
        buffered.unread(b"hello ").unwrap();
        assert_eq!(buffered.read(11).unwrap(), b"hello world");
    }
}
