// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A growable byte queue with `prepend`, used to let a stream "unread" bytes
//! it peeked at while scanning for a delimiter.

use std::collections::VecDeque;

#[derive(Default, Debug)]
pub struct Buffer {
    data: VecDeque<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends bytes at the tail, as if they had just arrived from the wire.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
    }

    /// Pushes bytes back onto the head, as if they had never been consumed.
    pub fn prepend(&mut self, bytes: &[u8]) {
        for &b in bytes.iter().rev() {
            self.data.push_front(b);
        }
    }

    /// Removes and returns up to `n` bytes from the head.
    pub fn consume(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.drain(..n).collect()
    }

    /// Drops everything past the first `len` bytes, as if the tail had
    /// never been appended. A no-op if the buffer is already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Returns up to `n` bytes from the head without removing them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        self.data.iter().take(n).copied().collect()
    }

    /// Searches for `needle`, scanning across the whole buffer regardless of
    /// how many separate `extend` calls produced its contents.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        let len = self.data.len();
        if needle.len() > len {
            return None;
        }
        'outer: for start in 0..=(len - needle.len()) {
            for (i, &nb) in needle.iter().enumerate() {
                if self.data[start + i] != nb {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_across_extend_boundary() {
        let mut buf = Buffer::new();
        buf.extend(b"abc\r");
        buf.extend(b"\nxyz");
        assert_eq!(buf.find(b"\r\n"), Some(3));
    }

    #[test]
    fn prepend_restores_unread_bytes() {
        let mut buf = Buffer::new();
        buf.extend(b"hello");
        let head = buf.consume(2);
        assert_eq!(head, b"he");
        buf.prepend(&head);
        assert_eq!(buf.consume(5), b"hello");
    }
}
