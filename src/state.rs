//! Summaries of where sender, receiver and connection are in their life cycles. None of these
//!  is stored anywhere: they are derived from observable facts each time they are needed, so
//!  they can never go out of sync with the actual stream and sequence number state.

use std::fmt::{Display, Formatter};
use crate::receiver::TcpReceiver;
use crate::sender::TcpSender;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SenderState {
    /// the outbound stream was terminated abnormally
    Error,
    /// nothing was sent yet
    Closed,
    /// the SYN is the only thing that was sent, and it is not acknowledged yet
    SynSent,
    SynAcked,
    /// the FIN was sent but not acknowledged yet
    FinSent,
    FinAcked,
}

impl SenderState {
    pub fn of(sender: &TcpSender) -> SenderState {
        let stream = sender.stream_in();
        let next_seqno = sender.next_seqno_absolute();

        if stream.error() {
            SenderState::Error
        }
        else if next_seqno == 0 {
            SenderState::Closed
        }
        else if next_seqno == sender.bytes_in_flight() {
            SenderState::SynSent
        }
        else if !stream.eof() || next_seqno < stream.bytes_written() + 2 {
            SenderState::SynAcked
        }
        else if sender.bytes_in_flight() > 0 {
            SenderState::FinSent
        }
        else {
            SenderState::FinAcked
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    /// the inbound stream was terminated abnormally
    Error,
    /// waiting for the peer's SYN
    Listen,
    SynReceived,
    /// the entire inbound stream including the FIN was received
    FinReceived,
}

impl ReceiverState {
    pub fn of(receiver: &TcpReceiver) -> ReceiverState {
        if receiver.stream_out().error() {
            ReceiverState::Error
        }
        else if receiver.ackno().is_none() {
            ReceiverState::Listen
        }
        else if receiver.fin_received() {
            ReceiverState::FinReceived
        }
        else {
            ReceiverState::SynReceived
        }
    }
}

/// The classic TCP connection states, derived from the sender's and receiver's states plus
///  the connection's `active` and `linger` flags
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    Closed,
    Reset,
}

impl ConnectionState {
    pub fn from_summaries(receiver: ReceiverState, sender: SenderState, active: bool, linger: bool) -> ConnectionState {
        use ConnectionState::*;

        match (receiver, sender, active) {
            (ReceiverState::Error, _, _) | (_, SenderState::Error, _) => Reset,
            (ReceiverState::Listen, SenderState::Closed, _) => Listen,
            (_, _, false) => Closed,

            (ReceiverState::Listen, _, true) => SynSent,
            (ReceiverState::SynReceived, SenderState::Closed | SenderState::SynSent, true) => SynReceived,
            (ReceiverState::SynReceived, SenderState::SynAcked, true) => Established,
            (ReceiverState::SynReceived, SenderState::FinSent, true) => FinWait1,
            (ReceiverState::SynReceived, SenderState::FinAcked, true) => FinWait2,
            (ReceiverState::FinReceived, SenderState::Closed | SenderState::SynSent | SenderState::SynAcked, true) => CloseWait,
            (ReceiverState::FinReceived, SenderState::FinSent, true) => if linger { Closing } else { LastAck },
            (ReceiverState::FinReceived, SenderState::FinAcked, true) => if linger { TimeWait } else { Closed },
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN-SENT",
            ConnectionState::SynReceived => "SYN-RECEIVED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::CloseWait => "CLOSE-WAIT",
            ConnectionState::LastAck => "LAST-ACK",
            ConnectionState::FinWait1 => "FIN-WAIT-1",
            ConnectionState::FinWait2 => "FIN-WAIT-2",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::TimeWait => "TIME-WAIT",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Reset => "RESET",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::config::TcpConfig;
    use crate::segment::{TcpFlags, TcpHeader, TcpSegment};
    use crate::wrapping_integers::WrappingU32;

    const ISN: WrappingU32 = WrappingU32::new(77);

    fn sender() -> TcpSender {
        TcpSender::new(&TcpConfig { fixed_isn: Some(ISN), ..Default::default() })
    }

    #[test]
    fn test_sender_life_cycle() {
        let mut sender = sender();
        assert_eq!(SenderState::of(&sender), SenderState::Closed);

        sender.fill_window();
        assert_eq!(SenderState::of(&sender), SenderState::SynSent);

        sender.ack_received(ISN + 1, 100);
        assert_eq!(SenderState::of(&sender), SenderState::SynAcked);

        sender.stream_in_mut().write(b"abc");
        sender.fill_window();
        assert_eq!(SenderState::of(&sender), SenderState::SynAcked);

        sender.stream_in_mut().end_input();
        sender.fill_window();
        assert_eq!(SenderState::of(&sender), SenderState::FinSent);

        sender.ack_received(ISN + 4, 100);
        assert_eq!(SenderState::of(&sender), SenderState::FinSent);

        sender.ack_received(ISN + 5, 100);
        assert_eq!(SenderState::of(&sender), SenderState::FinAcked);

        sender.stream_in_mut().set_error();
        assert_eq!(SenderState::of(&sender), SenderState::Error);
    }

    #[test]
    fn test_sender_with_unsent_data_after_end_input_is_syn_acked() {
        let mut sender = sender();
        sender.fill_window();
        sender.ack_received(ISN + 1, 2);
        sender.stream_in_mut().write(b"abcd");
        sender.stream_in_mut().end_input();
        sender.fill_window();

        assert_eq!(SenderState::of(&sender), SenderState::SynAcked);
    }

    fn segment(flags: TcpFlags, seqno: u32, payload: &'static [u8]) -> TcpSegment {
        TcpSegment::new(TcpHeader { seqno: WrappingU32::new(seqno), flags, ..Default::default() }, Bytes::from_static(payload))
    }

    #[test]
    fn test_receiver_life_cycle() {
        let mut receiver = TcpReceiver::new(100);
        assert_eq!(ReceiverState::of(&receiver), ReceiverState::Listen);

        receiver.segment_received(&segment(TcpFlags::SYN, 10, b""));
        assert_eq!(ReceiverState::of(&receiver), ReceiverState::SynReceived);

        receiver.segment_received(&segment(TcpFlags::FIN, 12, b"b"));
        assert_eq!(ReceiverState::of(&receiver), ReceiverState::SynReceived);

        receiver.segment_received(&segment(TcpFlags::empty(), 11, b"a"));
        assert_eq!(ReceiverState::of(&receiver), ReceiverState::FinReceived);

        receiver.stream_out_mut().set_error();
        assert_eq!(ReceiverState::of(&receiver), ReceiverState::Error);
    }

    #[rstest]
    #[case::listen(ReceiverState::Listen, SenderState::Closed, false, true, ConnectionState::Listen)]
    #[case::syn_sent(ReceiverState::Listen, SenderState::SynSent, true, true, ConnectionState::SynSent)]
    #[case::syn_received(ReceiverState::SynReceived, SenderState::SynSent, true, true, ConnectionState::SynReceived)]
    #[case::established(ReceiverState::SynReceived, SenderState::SynAcked, true, true, ConnectionState::Established)]
    #[case::close_wait(ReceiverState::FinReceived, SenderState::SynAcked, true, false, ConnectionState::CloseWait)]
    #[case::last_ack(ReceiverState::FinReceived, SenderState::FinSent, true, false, ConnectionState::LastAck)]
    #[case::closing(ReceiverState::FinReceived, SenderState::FinSent, true, true, ConnectionState::Closing)]
    #[case::fin_wait_1(ReceiverState::SynReceived, SenderState::FinSent, true, true, ConnectionState::FinWait1)]
    #[case::fin_wait_2(ReceiverState::SynReceived, SenderState::FinAcked, true, true, ConnectionState::FinWait2)]
    #[case::time_wait(ReceiverState::FinReceived, SenderState::FinAcked, true, true, ConnectionState::TimeWait)]
    #[case::closed(ReceiverState::FinReceived, SenderState::FinAcked, false, false, ConnectionState::Closed)]
    #[case::reset_receiver(ReceiverState::Error, SenderState::SynAcked, false, false, ConnectionState::Reset)]
    #[case::reset_sender(ReceiverState::SynReceived, SenderState::Error, false, false, ConnectionState::Reset)]
    fn test_connection_state(#[case] receiver: ReceiverState, #[case] sender: SenderState, #[case] active: bool, #[case] linger: bool, #[case] expected: ConnectionState) {
        assert_eq!(ConnectionState::from_summaries(receiver, sender, active, linger), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::TimeWait.to_string(), "TIME-WAIT");
        assert_eq!(ConnectionState::FinWait1.to_string(), "FIN-WAIT-1");
    }
}
