use bytes::{Buf, Bytes, BytesMut};
use std::cmp::min;
use crate::safe_converter::SafeCast;

/// A flow-controlled in-memory byte pipe: bytes are written at one end and read from the other
///  in FIFO order, with at most `capacity` bytes buffered at any given time.
///
/// Writing more than fits is not an error: `write()` accepts a prefix and reports how much it
///  took. Likewise reading from an empty stream just returns nothing.
///
/// NB: The error flag is never cleared once set. It does not touch buffered data, it only tells
///      the owner that the stream was terminated abnormally (e.g. by an RST) and that its
///      contents should not be trusted to be complete.
#[derive(Debug)]
pub struct ByteStream {
    capacity: usize,
    buffer: BytesMut,
    bytes_written: u64,
    bytes_read: u64,
    input_ended: bool,
    error: bool,
}

impl ByteStream {
    pub fn new(capacity: usize) -> ByteStream {
        ByteStream {
            capacity,
            buffer: BytesMut::with_capacity(capacity),
            bytes_written: 0,
            bytes_read: 0,
            input_ended: false,
            error: false,
        }
    }

    /// Write as much of `data` as fits, returning the number of bytes accepted
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.input_ended {
            return 0;
        }

        let num_accepted = min(data.len(), self.remaining_capacity());
        self.buffer.extend_from_slice(&data[..num_accepted]);
        self.bytes_written += num_accepted.safe_cast();
        num_accepted
    }

    /// Look at up to `len` bytes from the output side without removing them
    pub fn peek(&self, len: usize) -> &[u8] {
        &self.buffer[..min(len, self.buffer.len())]
    }

    /// Remove up to `len` bytes from the output side
    pub fn pop(&mut self, len: usize) {
        let num_popped = min(len, self.buffer.len());
        self.buffer.advance(num_popped);
        self.bytes_read += num_popped.safe_cast();
    }

    /// Remove and return up to `len` bytes from the output side
    pub fn read(&mut self, len: usize) -> Bytes {
        let num_read = min(len, self.buffer.len());
        self.bytes_read += num_read.safe_cast();
        self.buffer.split_to(num_read).freeze()
    }

    pub fn end_input(&mut self) {
        self.input_ended = true;
    }

    pub fn input_ended(&self) -> bool {
        self.input_ended
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    pub fn error(&self) -> bool {
        self.error
    }

    /// `true` if the input has ended and everything written was read
    pub fn eof(&self) -> bool {
        self.input_ended && self.buffer.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.buffer.len()
    }
}
