use std::collections::VecDeque;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::byte_stream::ByteStream;
use crate::config::TcpConfig;
use crate::receiver::TcpReceiver;
use crate::safe_converter::clamp_to_u16;
use crate::segment::{TcpFlags, TcpSegment};
use crate::sender::TcpSender;
use crate::state::{ConnectionState, ReceiverState, SenderState};

/// A TCP connection built from a [TcpSender] and a [TcpReceiver]. It drives the handshake and
///  close sequences, stamps outgoing segments with acknowledgement number and window, and
///  aborts the connection on RST or when the peer stops responding.
///
/// The connection does no I/O and has no notion of wall-clock time: the owner feeds it inbound
///  segments and elapsed time, and picks up outbound segments from `segments_out_mut()`.
pub struct TcpConnection {
    config: TcpConfig,
    sender: TcpSender,
    receiver: TcpReceiver,
    segments_out: VecDeque<TcpSegment>,

    active: bool,
    /// whether the connection has to wait for the peer's retransmissions after both streams
    ///  finished, i.e. whether it is the one that finishes closing last
    linger_after_streams_finish: bool,
    time_since_last_segment_received: u64,

    last_logged_state: ConnectionState,
}

impl TcpConnection {
    pub fn new(config: TcpConfig) -> TcpConnection {
        let sender = TcpSender::new(&config);
        let receiver = TcpReceiver::new(config.recv_capacity);

        TcpConnection {
            config,
            sender,
            receiver,
            segments_out: Default::default(),
            active: false,
            linger_after_streams_finish: true,
            time_since_last_segment_received: 0,
            last_logged_state: ConnectionState::Listen,
        }
    }

    /// active open: send a SYN
    pub fn connect(&mut self) {
        self.do_connect();
        self.log_state_change();
    }

    fn do_connect(&mut self) {
        self.sender.fill_window();
        self.active = true;
        self.flush_sender();
    }

    /// Write as much of `data` to the outbound stream as fits, returning the number of bytes
    ///  that were accepted
    pub fn write(&mut self, data: &[u8]) -> usize {
        let num_written = self.sender.stream_in_mut().write(data);
        self.push_outbound();
        num_written
    }

    /// close the outbound stream, sending a FIN once all buffered data went out
    pub fn end_input_stream(&mut self) {
        self.sender.stream_in_mut().end_input();
        self.push_outbound();
        self.log_state_change();
    }

    /// NB: Before the connection was opened, data stays buffered: the SYN must come first
    fn push_outbound(&mut self) {
        if SenderState::of(&self.sender) != SenderState::Closed {
            self.sender.fill_window();
        }
        self.flush_sender();
    }

    pub fn segment_received(&mut self, segment: &TcpSegment) {
        self.handle_segment(segment);
        self.log_state_change();
    }

    fn handle_segment(&mut self, segment: &TcpSegment) {
        let header = &segment.header;

        if !self.active {
            if self.sender.next_seqno_absolute() > 0 || self.receiver.stream_out().error() {
                debug!("connection is closed - ignoring segment {:?}", segment);
                return;
            }
            if !header.syn() {
                debug!("listening - ignoring segment {:?} without SYN", segment);
                return;
            }
        }

        trace!("received segment {:?}", segment);
        self.time_since_last_segment_received = 0;
        let mut need_ack = segment.length_in_sequence_space() > 0;

        let isn_was_known = self.receiver.isn().is_some();
        self.receiver.segment_received(segment);

        if header.rst() {
            warn!("connection reset by peer");
            self.reset(false);
            return;
        }

        debug_assert!(self.sender.segments_out_mut().is_empty());

        // an ACK is meaningless before we sent anything
        if header.ack() && self.sender.next_seqno_absolute() > 0 {
            self.sender.ack_received(header.ackno, header.win);
            if !self.sender.segments_out_mut().is_empty() {
                // outgoing data carries the ack
                need_ack = false;
            }
        }

        // NB: the peer's first segment may carry FIN as well, so this can not be based on
        //      ReceiverState::SynReceived
        if !isn_was_known && self.receiver.isn().is_some() && SenderState::of(&self.sender) == SenderState::Closed {
            debug!("passive open");
            self.do_connect();
            return;
        }

        let receiver_state = ReceiverState::of(&self.receiver);

        if receiver_state == ReceiverState::FinReceived && SenderState::of(&self.sender) == SenderState::SynAcked {
            // the peer closed first, so it is the one to linger
            self.linger_after_streams_finish = false;
        }

        if self.streams_finished() && !self.linger_after_streams_finish {
            debug!("both streams finished - closing without TIME-WAIT");
            self.active = false;
            return;
        }

        if need_ack && self.receiver.ackno().is_some() {
            self.sender.send_empty_segment();
        }
        self.flush_sender();
    }

    /// Pass elapsed time to the connection, driving retransmission and TIME-WAIT
    pub fn tick(&mut self, ms_since_last_tick: u64) {
        self.do_tick(ms_since_last_tick);
        self.log_state_change();
    }

    fn do_tick(&mut self, ms_since_last_tick: u64) {
        if !self.active {
            return;
        }

        debug_assert!(self.sender.segments_out_mut().is_empty());
        self.sender.tick(ms_since_last_tick);

        if self.sender.consecutive_retransmissions() > self.config.max_retx_attempts {
            warn!("no response from peer after {} retransmissions - resetting connection", self.sender.consecutive_retransmissions());
            self.sender.segments_out_mut().clear();
            self.reset(true);
            return;
        }
        self.flush_sender();

        self.time_since_last_segment_received += ms_since_last_tick;
        if self.streams_finished() && self.linger_after_streams_finish && self.time_since_last_segment_received >= 10 * self.config.rt_timeout_millis {
            debug!("TIME-WAIT expired");
            self.active = false;
            self.linger_after_streams_finish = false;
        }
    }

    /// Unclean shutdown: send an RST and mark both streams as failed
    pub fn abort(&mut self) {
        let send_rst = self.active;
        self.reset(send_rst);
        self.log_state_change();
    }

    fn reset(&mut self, send_rst: bool) {
        if send_rst {
            self.sender.send_reset();
            self.flush_sender();
        }
        self.receiver.stream_out_mut().set_error();
        self.sender.stream_in_mut().set_error();
        self.linger_after_streams_finish = false;
        self.active = false;
    }

    /// the peer's FIN was received and our own FIN was acknowledged
    fn streams_finished(&self) -> bool {
        ReceiverState::of(&self.receiver) == ReceiverState::FinReceived
            && SenderState::of(&self.sender) == SenderState::FinAcked
    }

    /// move segments from the sender to the outbound queue, stamping them with ackno and window
    fn flush_sender(&mut self) {
        while let Some(mut segment) = self.sender.segments_out_mut().pop_front() {
            if let Some(ackno) = self.receiver.ackno() {
                segment.header.flags |= TcpFlags::ACK;
                segment.header.ackno = ackno;
                segment.header.win = clamp_to_u16(self.receiver.window_size());
            }
            trace!("sending {:?}", segment);
            self.segments_out.push_back(segment);
        }
    }

    fn log_state_change(&mut self) {
        let state = self.state();
        if state != self.last_logged_state {
            debug!("{} -> {}", self.last_logged_state, state);
            self.last_logged_state = state;
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_summaries(
            ReceiverState::of(&self.receiver),
            SenderState::of(&self.sender),
            self.active,
            self.linger_after_streams_finish,
        )
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn linger_after_streams_finish(&self) -> bool {
        self.linger_after_streams_finish
    }

    /// segments waiting to be transmitted, in the order they must go on the wire
    pub fn segments_out_mut(&mut self) -> &mut VecDeque<TcpSegment> {
        &mut self.segments_out
    }

    pub fn inbound_stream(&self) -> &ByteStream {
        self.receiver.stream_out()
    }

    pub fn inbound_stream_mut(&mut self) -> &mut ByteStream {
        self.receiver.stream_out_mut()
    }

    /// read up to `len` bytes that arrived from the peer
    pub fn read(&mut self, len: usize) -> Bytes {
        self.receiver.stream_out_mut().read(len)
    }

    pub fn remaining_outbound_capacity(&self) -> usize {
        self.sender.stream_in().remaining_capacity()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.sender.bytes_in_flight()
    }

    pub fn unassembled_bytes(&self) -> usize {
        self.receiver.unassembled_bytes()
    }

    pub fn time_since_last_segment_received(&self) -> u64 {
        self.time_since_last_segment_received
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if self.active {
            warn!("unclean shutdown of TCP connection in state {}", self.state());
            self.reset(true);
        }
    }
}
