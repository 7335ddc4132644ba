// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Bounded-memory chunked reading of large element payloads.

use std::io::{self, Read};

/// Streams a known number of fixed-size elements out of a reader while
/// holding at most `capacity` elements worth of bytes in memory.
///
/// Storage payloads can be hundreds of megabytes; decoding them element by
/// element through this reader caps the buffer instead of slurping the
/// whole payload.
pub struct LimitedBufferReader<R> {
    rdr: R,
    scalar_size: usize,
    remaining_bytes: usize,
    buf: Vec<u8>,
    buf_index: usize,
}

impl<R: Read> LimitedBufferReader<R> {
    /// `count` elements of `scalar_size` bytes each will be yielded;
    /// `capacity` is the buffer size in elements.
    pub fn new(rdr: R, count: usize, scalar_size: usize, capacity: usize) -> Self {
        let size = capacity.max(1) * scalar_size;
        LimitedBufferReader {
            rdr,
            scalar_size,
            remaining_bytes: scalar_size * count,
            buf: vec![0; size],
            buf_index: size,
        }
    }

    pub fn has_next(&self) -> bool {
        self.remaining_bytes != 0
    }

    /// Returns the next element as a contiguous `scalar_size`-byte slice.
    /// A short upstream read is an error, as is reading past the element
    /// budget.
    pub fn read_next(&mut self) -> io::Result<&[u8]> {
        if self.remaining_bytes == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                      "element budget exhausted"));
        }
        if self.buf_index == self.buf.len() {
            self.buf_index = 0;
            if self.remaining_bytes < self.buf.len() {
                self.buf.truncate(self.remaining_bytes);
            }
            self.rdr.read_exact(&mut self.buf)?;
        }
        let result = &self.buf[self.buf_index..self.buf_index + self.scalar_size];
        self.buf_index += self.scalar_size;
        self.remaining_bytes -= self.scalar_size;
        Ok(result)
    }
}
