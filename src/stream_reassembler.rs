use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use bytes::{Bytes, BytesMut};
use tracing::trace;
use crate::byte_stream::ByteStream;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Assembles substrings of a byte stream that arrive out of order, possibly overlapping and
///  possibly duplicated, into an in-order [ByteStream].
///
/// Each substring is tagged with the (zero-based) index of its first byte in the overall stream.
///  Bytes that extend the contiguous prefix are written to the output stream right away; the
///  rest is kept in a pending store until the gap before them is filled.
///
/// Memory is bounded by `capacity`, which covers both the bytes that were assembled but not
///  read yet by the output stream's consumer, and the pending bytes. Bytes that would not fit
///  are discarded and need to be sent again by the peer - this is what the advertised window
///  is for.
pub struct StreamReassembler {
    capacity: usize,
    output: ByteStream,

    /// Pending fragments keyed by the index of their first byte.
    ///
    /// NB: Fragments never overlap. Adjacent fragments may or may not be merged.
    pending: BTreeMap<u64, Bytes>,
    unassembled_bytes: usize,

    /// The index *after* the last byte of the stream, once a substring flagged `eof` was seen
    end_index: Option<u64>,
}

impl StreamReassembler {
    pub fn new(capacity: usize) -> StreamReassembler {
        StreamReassembler {
            capacity,
            output: ByteStream::new(capacity),
            pending: Default::default(),
            unassembled_bytes: 0,
            end_index: None,
        }
    }

    /// the index of the next byte that will be written to the output stream
    pub fn next_assembled_index(&self) -> u64 {
        self.output.bytes_written()
    }

    /// the index of the first byte that does not fit into the reassembler's capacity
    fn first_unacceptable_index(&self) -> u64 {
        self.output.bytes_read() + self.capacity.safe_cast()
    }

    pub fn push_substring(&mut self, data: &[u8], index: u64, eof: bool) {
        if self.output.input_ended() {
            trace!("stream already ended - ignoring substring at {}", index);
            return;
        }

        let data_end = index + data.len().safe_cast();
        if eof {
            self.end_index = Some(data_end);
        }

        let mut start = index.max(self.next_assembled_index());
        let mut end = data_end.min(self.first_unacceptable_index());
        if let Some(end_index) = self.end_index {
            end = end.min(end_index);
        }

        if start < end {
            let clip_from: usize = (start - index).prechecked_cast();
            let clip_to: usize = (end - index).prechecked_cast();
            self.store(&mut start, &mut end, &data[clip_from..clip_to]);
        }
        else {
            trace!("substring [{}, {}) is outside the acceptable window - dropping", index, data_end);
        }

        self.drain();

        if let Some(end_index) = self.end_index {
            if self.next_assembled_index() >= end_index {
                self.output.end_input();
            }
        }
    }

    /// Merge `data` covering `[start, end)` into the pending store, combining it with all
    ///  fragments it overlaps or touches so that no byte is stored twice.
    fn store(&mut self, start: &mut u64, end: &mut u64, data: &[u8]) {
        let mut merged = BytesMut::from(data);

        if let Some((&prev_start, prev)) = self.pending.range(..=*start).next_back() {
            let prev_end = prev_start + prev.len().safe_cast();
            if prev_end >= *end {
                trace!("substring [{}, {}) is already pending", start, end);
                return;
            }
            if prev_end >= *start {
                let prefix_len: usize = (*start - prev_start).prechecked_cast();
                let mut combined = BytesMut::from(&prev[..prefix_len]);
                combined.extend_from_slice(&merged);
                merged = combined;
                *start = prev_start;
            }
        }

        let following = self.pending.range((Excluded(*start), Included(*end)))
            .map(|(&k, _)| k)
            .collect::<Vec<_>>();
        for next_start in following {
            if let Some(next) = self.pending.remove(&next_start) {
                self.unassembled_bytes -= next.len();
                let next_end = next_start + next.len().safe_cast();
                if next_end > *end {
                    let overlap: usize = (*end - next_start).prechecked_cast();
                    merged.extend_from_slice(&next[overlap..]);
                    *end = next_end;
                }
            }
        }

        if let Some(prev) = self.pending.remove(start) {
            self.unassembled_bytes -= prev.len();
        }

        debug_assert_eq!(merged.len().safe_cast(), *end - *start);
        self.unassembled_bytes += merged.len();
        self.pending.insert(*start, merged.freeze());
    }

    /// write pending fragments to the output stream for as long as they are contiguous
    fn drain(&mut self) {
        loop {
            let next_index = self.next_assembled_index();
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if *entry.key() != next_index {
                break;
            }

            let fragment = entry.remove();
            let num_written = self.output.write(&fragment);
            self.unassembled_bytes -= num_written;

            if num_written < fragment.len() {
                // the output stream is full - keep the remainder for later
                let rest = fragment.slice(num_written..);
                self.pending.insert(self.next_assembled_index(), rest);
                break;
            }
        }
    }

    /// number of bytes that are stored but not yet assembled, each byte counted once
    pub fn unassembled_bytes(&self) -> usize {
        self.unassembled_bytes
    }

    /// `true` if no substrings are waiting to be assembled
    pub fn empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stream_out(&self) -> &ByteStream {
        &self.output
    }

    pub fn stream_out_mut(&mut self) -> &mut ByteStream {
        &mut self.output
    }
}
