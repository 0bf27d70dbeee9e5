use std::cmp::{max, min};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};
use crate::byte_stream::ByteStream;
use crate::config::TcpConfig;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::segment::{TcpFlags, TcpHeader, TcpSegment};
use crate::timer::RetransmissionTimer;
use crate::wrapping_integers::{unwrap, wrap, WrappingU32};

/// The outbound half of a connection: it reads from the outbound [ByteStream], cuts the data
///  into segments that fit the peer's advertised window, and keeps every segment until it is
///  acknowledged, retransmitting the oldest one when the retransmission timer expires.
///
/// Segments are queued in `segments_out` for the owner to pick up; they carry sequence number,
///  flags and payload. Acknowledgement number and window are the owner's business.
pub struct TcpSender {
    isn: WrappingU32,
    max_payload_size: usize,
    stream: ByteStream,
    segments_out: VecDeque<TcpSegment>,

    /// absolute sequence number of the next byte to be sent
    next_seqno: u64,
    /// segments that were sent but not acknowledged yet, keyed by their absolute sequence number
    outstanding: BTreeMap<u64, TcpSegment>,
    bytes_in_flight: u64,

    /// the window the peer advertised last, 1 until the first ack arrives
    last_window_size: u16,
    timer: RetransmissionTimer,
    consecutive_retransmissions: u32,

    syn_sent: bool,
    fin_sent: bool,
}

impl TcpSender {
    pub fn new(config: &TcpConfig) -> TcpSender {
        TcpSender {
            isn: config.initial_sequence_number(),
            max_payload_size: config.max_payload_size,
            stream: ByteStream::new(config.send_capacity),
            segments_out: Default::default(),
            next_seqno: 0,
            outstanding: Default::default(),
            bytes_in_flight: 0,
            last_window_size: 1,
            timer: RetransmissionTimer::new(config.rt_timeout_millis),
            consecutive_retransmissions: 0,
            syn_sent: false,
            fin_sent: false,
        }
    }

    /// Send as many segments as the peer's window allows, starting with the SYN and ending
    ///  with the FIN once the outbound stream is exhausted.
    ///
    /// NB: A zero window is treated as a window of one byte so the peer gets probed and
    ///      eventually tells us when it has room again.
    pub fn fill_window(&mut self) {
        let window: u64 = max(self.last_window_size, 1).into();

        while window > self.bytes_in_flight {
            let mut flags = TcpFlags::empty();
            if !self.syn_sent {
                flags |= TcpFlags::SYN;
                self.syn_sent = true;
            }
            let syn_len = if flags.contains(TcpFlags::SYN) { 1 } else { 0 };

            let room = window - self.bytes_in_flight - syn_len;
            let payload = self.stream.read(min(self.max_payload_size.safe_cast(), room).prechecked_cast());
            let payload_len: u64 = payload.len().safe_cast();

            if !self.fin_sent && self.stream.eof() && self.bytes_in_flight + syn_len + payload_len < window {
                flags |= TcpFlags::FIN;
                self.fin_sent = true;
            }

            let segment = TcpSegment::new(
                TcpHeader { seqno: self.next_seqno(), flags, ..Default::default() },
                payload,
            );
            let segment_len = segment.length_in_sequence_space();
            if segment_len == 0 {
                break;
            }

            if self.outstanding.is_empty() {
                self.timer.reset();
            }

            trace!("sending segment {:?} at {}", segment, self.next_seqno);
            self.segments_out.push_back(segment.clone());
            self.outstanding.insert(self.next_seqno, segment);
            self.bytes_in_flight += segment_len;
            self.next_seqno += segment_len;

            if flags.contains(TcpFlags::FIN) {
                break;
            }
        }
    }

    /// Process the acknowledgement number and window advertised by the peer
    pub fn ack_received(&mut self, ackno: WrappingU32, window_size: u16) {
        let abs_ackno = unwrap(ackno, self.isn, self.next_seqno);
        if abs_ackno > self.next_seqno {
            debug!("ignoring ack for {} which is beyond the next sequence number {}", abs_ackno, self.next_seqno);
            return;
        }

        let mut acked_any = false;
        while let Some(entry) = self.outstanding.first_entry() {
            let segment_len = entry.get().length_in_sequence_space();
            if *entry.key() + segment_len > abs_ackno {
                break;
            }
            entry.remove();
            self.bytes_in_flight -= segment_len;
            acked_any = true;
        }

        if acked_any {
            trace!("ack {}: {} bytes still in flight", abs_ackno, self.bytes_in_flight);
            self.timer.reset();
        }
        self.consecutive_retransmissions = 0;
        self.last_window_size = window_size;

        self.fill_window();
    }

    /// Advance the retransmission timer, retransmitting the oldest outstanding segment if it
    ///  expired
    pub fn tick(&mut self, ms_since_last_tick: u64) {
        self.timer.advance(ms_since_last_tick);

        let Some((&seqno, oldest)) = self.outstanding.first_key_value() else {
            return;
        };
        if !self.timer.expired() {
            return;
        }

        // a timeout with a closed window is expected probing, not a sign of congestion
        if self.last_window_size > 0 {
            self.timer.back_off();
        }
        self.timer.restart();
        self.consecutive_retransmissions += 1;

        debug!("retransmitting segment at {} (attempt #{}), timeout is now {}ms", seqno, self.consecutive_retransmissions, self.timer.timeout());
        self.segments_out.push_back(oldest.clone());
    }

    /// queue a segment without payload and flags at the current position, e.g. for a pure ack
    pub fn send_empty_segment(&mut self) {
        self.send_flags_only(TcpFlags::empty());
    }

    pub fn send_reset(&mut self) {
        self.send_flags_only(TcpFlags::RST);
    }

    fn send_flags_only(&mut self, flags: TcpFlags) {
        let segment = TcpSegment::new(
            TcpHeader { seqno: self.next_seqno(), flags, ..Default::default() },
            Default::default(),
        );
        self.segments_out.push_back(segment);
    }

    pub fn segments_out_mut(&mut self) -> &mut VecDeque<TcpSegment> {
        &mut self.segments_out
    }

    pub fn stream_in(&self) -> &ByteStream {
        &self.stream
    }

    pub fn stream_in_mut(&mut self) -> &mut ByteStream {
        &mut self.stream
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn consecutive_retransmissions(&self) -> u32 {
        self.consecutive_retransmissions
    }

    pub fn next_seqno_absolute(&self) -> u64 {
        self.next_seqno
    }

    pub fn next_seqno(&self) -> WrappingU32 {
        wrap(self.next_seqno, self.isn)
    }

    pub fn isn(&self) -> WrappingU32 {
        self.isn
    }

    pub fn current_timeout(&self) -> u64 {
        self.timer.timeout()
    }
}
