use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::wrapping_integers::WrappingU32;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// The fixed part of a TCP header. Options are skipped when parsing and never written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seqno: WrappingU32,
    /// only meaningful if [TcpFlags::ACK] is set
    pub ackno: WrappingU32,
    pub flags: TcpFlags,
    pub win: u16,
    pub cksum: u16,
    pub uptr: u16,
}

impl Default for TcpHeader {
    fn default() -> Self {
        TcpHeader {
            sport: 0,
            dport: 0,
            seqno: WrappingU32::new(0),
            ackno: WrappingU32::new(0),
            flags: TcpFlags::empty(),
            win: 0,
            cksum: 0,
            uptr: 0,
        }
    }
}

impl TcpHeader {
    pub const LENGTH: usize = 20;

    /// data offset (in 32 bit words) of a header without options
    const MIN_DOFF: u8 = 5;

    pub fn syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }
    pub fn ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }
    pub fn fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }
    pub fn rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.sport);
        buf.put_u16(self.dport);
        buf.put_u32(self.seqno.raw());
        buf.put_u32(self.ackno.raw());
        buf.put_u8(Self::MIN_DOFF << 4);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.win);
        buf.put_u16(self.cksum);
        buf.put_u16(self.uptr);
    }

    /// returns the header and the number of option bytes that follow it
    fn deser(buf: &mut impl Buf) -> anyhow::Result<(TcpHeader, usize)> {
        let sport = buf.try_get_u16()?;
        let dport = buf.try_get_u16()?;
        let seqno = WrappingU32::new(buf.try_get_u32()?);
        let ackno = WrappingU32::new(buf.try_get_u32()?);
        let doff = buf.try_get_u8()? >> 4;
        let flags = TcpFlags::from_bits_truncate(buf.try_get_u8()?);
        let win = buf.try_get_u16()?;
        let cksum = buf.try_get_u16()?;
        let uptr = buf.try_get_u16()?;

        if doff < Self::MIN_DOFF {
            bail!("data offset {} is shorter than the fixed header", doff);
        }
        let option_words: usize = (doff - Self::MIN_DOFF).safe_cast();
        let options_len = option_words * 4;

        Ok((TcpHeader { sport, dport, seqno, ackno, flags, win, cksum, uptr }, options_len))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Bytes,
}

impl Debug for TcpSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?} seq={} ack={} win={} len={}]", self.header.flags, self.header.seqno, self.header.ackno, self.header.win, self.payload.len())
    }
}

impl TcpSegment {
    pub fn new(header: TcpHeader, payload: Bytes) -> TcpSegment {
        TcpSegment { header, payload }
    }

    /// payload length plus one for each of SYN and FIN
    pub fn length_in_sequence_space(&self) -> u64 {
        self.payload.len().safe_cast()
            + if self.header.syn() { 1 } else { 0 }
            + if self.header.fin() { 1 } else { 0 }
    }

    /// Parse a segment from a raw buffer, verifying the checksum. `pseudo_header_sum` is the
    ///  ones-complement sum of the datagram layer's pseudo-header, or 0 if there is none.
    pub fn deser(buf: &[u8], pseudo_header_sum: u32) -> anyhow::Result<TcpSegment> {
        if buf.len() < TcpHeader::LENGTH {
            bail!("segment of {} bytes is shorter than a TCP header", buf.len());
        }

        let mut checksum = InternetChecksum::new(pseudo_header_sum);
        checksum.add(buf);
        if checksum.value() != 0 {
            bail!("checksum mismatch");
        }

        let mut remaining = buf;
        let (header, options_len) = TcpHeader::deser(&mut remaining)?;
        if options_len > remaining.len() {
            bail!("data offset points beyond the end of the segment");
        }
        let payload = Bytes::copy_from_slice(&remaining[options_len..]);

        Ok(TcpSegment { header, payload })
    }

    /// Serialize the segment, recomputing its checksum
    pub fn ser(&self, pseudo_header_sum: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(TcpHeader::LENGTH + self.payload.len());

        let header = TcpHeader { cksum: 0, ..self.header.clone() };
        header.ser(&mut buf);
        buf.put_slice(&self.payload);

        let mut checksum = InternetChecksum::new(pseudo_header_sum);
        checksum.add(&buf);
        buf[16..18].copy_from_slice(&checksum.value().to_be_bytes());
        buf
    }
}

/// RFC 1071 ones-complement sum over big-endian 16 bit words
struct InternetChecksum {
    sum: u64,
    parity: bool,
}

impl InternetChecksum {
    fn new(initial_sum: u32) -> InternetChecksum {
        InternetChecksum {
            sum: initial_sum.into(),
            parity: false,
        }
    }

    /// NB: chunks may have odd length, the byte alignment carries over between calls
    fn add(&mut self, data: &[u8]) {
        for &b in data {
            let value: u64 = b.into();
            self.sum += if self.parity { value } else { value << 8 };
            self.parity = !self.parity;
        }
    }

    fn value(&self) -> u16 {
        let mut sum = self.sum;
        while sum > 0xffff {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        let folded: u16 = sum.prechecked_cast();
        !folded
    }
}
