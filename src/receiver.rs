use tracing::{debug, trace};
use crate::byte_stream::ByteStream;
use crate::segment::TcpSegment;
use crate::stream_reassembler::StreamReassembler;
use crate::wrapping_integers::{unwrap, wrap, WrappingU32};

/// The inbound half of a connection: it translates sequence numbers of incoming segments into
///  stream indices, feeds their payload to a [StreamReassembler], and derives the
///  acknowledgement number and window to advertise to the peer.
pub struct TcpReceiver {
    reassembler: StreamReassembler,
    /// the peer's initial sequence number, known once the first SYN arrived
    isn: Option<WrappingU32>,
    /// absolute sequence number *after* the peer's FIN, once a FIN arrived
    fin_index: Option<u64>,
    /// absolute sequence number of the next expected byte, used as reference for unwrapping
    checkpoint: u64,
}

impl TcpReceiver {
    pub fn new(capacity: usize) -> TcpReceiver {
        TcpReceiver {
            reassembler: StreamReassembler::new(capacity),
            isn: None,
            fin_index: None,
            checkpoint: 0,
        }
    }

    pub fn segment_received(&mut self, segment: &TcpSegment) {
        let header = &segment.header;

        if header.syn() {
            match self.isn {
                None => {
                    trace!("peer's ISN is {}", header.seqno);
                    self.isn = Some(header.seqno);
                }
                Some(isn) if isn != header.seqno => {
                    debug!("ignoring SYN with seqno {} - the peer's ISN is already known to be {}", header.seqno, isn);
                    return;
                }
                _ => {}
            }
        }

        let Some(isn) = self.isn else {
            trace!("no SYN received yet - dropping segment {:?}", segment);
            return;
        };

        let abs_seqno = unwrap(header.seqno, isn, self.checkpoint);
        if header.fin() {
            self.fin_index = Some(abs_seqno + segment.length_in_sequence_space());
        }

        // the SYN occupies absolute sequence number 0, the stream starts at 1
        let stream_index = if header.syn() {
            Some(abs_seqno)
        }
        else {
            abs_seqno.checked_sub(1)
        };
        let Some(stream_index) = stream_index else {
            debug!("segment {:?} overlaps the SYN's sequence number without carrying a SYN - dropping", segment);
            return;
        };

        self.reassembler.push_substring(&segment.payload, stream_index, header.fin());

        let output = self.reassembler.stream_out();
        self.checkpoint = output.bytes_written() + 1;
        if output.input_ended() {
            self.checkpoint += 1;
        }
    }

    /// The acknowledgement number to send to the peer, i.e. the sequence number of the first
    ///  byte that was not received yet. `None` before the peer's SYN arrived.
    pub fn ackno(&self) -> Option<WrappingU32> {
        self.isn.map(|isn| wrap(self.checkpoint, isn))
    }

    /// the room left for bytes that were not read by the application yet
    pub fn window_size(&self) -> usize {
        self.reassembler.capacity() - self.reassembler.stream_out().buffer_size()
    }

    pub fn unassembled_bytes(&self) -> usize {
        self.reassembler.unassembled_bytes()
    }

    pub fn fin_index(&self) -> Option<u64> {
        self.fin_index
    }

    pub fn isn(&self) -> Option<WrappingU32> {
        self.isn
    }

    /// number of sequence numbers received in order, SYN and FIN included
    pub fn absolute_ackno(&self) -> Option<u64> {
        self.isn.map(|_| self.checkpoint)
    }

    pub fn stream_out(&self) -> &ByteStream {
        self.reassembler.stream_out()
    }

    pub fn stream_out_mut(&mut self) -> &mut ByteStream {
        self.reassembler.stream_out_mut()
    }

    /// `true` once the whole inbound stream up to and including the FIN was received
    pub fn fin_received(&self) -> bool {
        self.stream_out().input_ended()
    }

    /// a FIN arrived, but there are still bytes missing before it
    pub fn fin_pending(&self) -> bool {
        self.fin_index.is_some() && !self.fin_received()
    }
}
