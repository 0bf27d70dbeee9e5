use std::time::Duration;
use anyhow::bail;
use crate::wrapping_integers::WrappingU32;

#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// The retransmission timeout (in milliseconds) that is used initially and after each
    ///  acknowledgement of new data. It doubles with every retransmission that happens while
    ///  the peer advertises a non-zero window.
    pub rt_timeout_millis: u64,

    /// Capacity of the inbound side: the reassembler never buffers more than this number of
    ///  bytes, counting both reassembled-but-unread and not-yet-assembled bytes. This is also the
    ///  upper bound for the window advertised to the peer (clamped to the 16 bit header field).
    pub recv_capacity: usize,

    /// Capacity of the outbound byte stream, i.e. the number of bytes the application can write
    ///  ahead of what is handed to the sender for segmentation
    pub send_capacity: usize,

    /// Maximum number of payload bytes in a single segment. SYN and FIN do not count against this.
    pub max_payload_size: usize,

    /// Number of consecutive retransmissions of the same segment that is tolerated. Exceeding
    ///  it aborts the connection with an RST.
    pub max_retx_attempts: u32,

    /// The initial sequence number for the outbound stream. A random ISN is chosen if this is
    ///  `None`, which is what production code should do; a fixed ISN is for deterministic tests.
    pub fixed_isn: Option<WrappingU32>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            rt_timeout_millis: 1000,
            recv_capacity: 64000,
            send_capacity: 64000,
            max_payload_size: 1000,
            max_retx_attempts: 8,
            fixed_isn: None,
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rt_timeout_millis == 0 {
            bail!("retransmission timeout must be positive");
        }
        if self.recv_capacity == 0 {
            bail!("receive capacity must be positive");
        }
        if self.send_capacity == 0 {
            bail!("send capacity must be positive");
        }
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        Ok(())
    }

    pub fn initial_sequence_number(&self) -> WrappingU32 {
        self.fixed_isn
            .unwrap_or_else(|| WrappingU32::new(rand::random()))
    }
}

#[derive(Clone, Debug)]
pub struct UdpAdapterConfig {
    pub tcp: TcpConfig,

    /// Interval at which the event loop passes elapsed time to the connection. This is the
    ///  granularity of retransmission and TIME-WAIT timing.
    pub tick_interval: Duration,

    /// Number of received chunks that can be waiting for the application. When this is
    ///  exhausted, bytes stay in the connection's inbound stream and the advertised window
    ///  shrinks accordingly.
    pub inbound_channel_size: usize,

    pub max_datagram_size: usize,
}

impl Default for UdpAdapterConfig {
    fn default() -> Self {
        UdpAdapterConfig {
            tcp: TcpConfig::default(),
            tick_interval: Duration::from_millis(10),
            inbound_channel_size: 64,
            max_datagram_size: 65535,
        }
    }
}

impl UdpAdapterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.tcp.validate()?;

        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.inbound_channel_size == 0 {
            bail!("inbound channel size must be positive");
        }
        if self.max_datagram_size < crate::segment::TcpHeader::LENGTH + self.tcp.max_payload_size {
            bail!("max datagram size {} can not hold a TCP header plus {} bytes of payload", self.max_datagram_size, self.tcp.max_payload_size);
        }
        Ok(())
    }
}
