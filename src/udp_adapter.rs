use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::config::{TcpConfig, UdpAdapterConfig};
use crate::connection::TcpConnection;
use crate::segment::TcpSegment;
use crate::state::ConnectionState;

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O part
///  away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Runs a single [TcpConnection] with each segment carried in a UDP datagram, i.e. without IP
///  layer. There is no pseudo-header, so checksums cover the segment only.
pub struct TcpOverUdp {
    connection: TcpConnection,
    socket: Arc<dyn DatagramSocket>,
    /// `None` while listening, until the first SYN arrives
    peer: Option<SocketAddr>,
}

impl TcpOverUdp {
    pub fn new(config: TcpConfig, socket: Arc<dyn DatagramSocket>, peer: Option<SocketAddr>) -> TcpOverUdp {
        TcpOverUdp {
            connection: TcpConnection::new(config),
            socket,
            peer,
        }
    }

    pub fn connection(&self) -> &TcpConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut TcpConnection {
        &mut self.connection
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn on_datagram(&mut self, from: SocketAddr, buf: &[u8]) {
        if let Some(peer) = self.peer {
            if peer != from {
                debug!("received datagram from {:?}, but the peer is {:?} - dropping", from, peer);
                return;
            }
        }

        let segment = match TcpSegment::deser(buf, 0) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("received unparseable datagram from {:?}: {} - dropping", from, e);
                return;
            }
        };

        self.connection.segment_received(&segment);

        if self.peer.is_none() && self.connection.active() {
            info!("accepted connection from {:?}", from);
            self.peer = Some(from);
        }

        self.flush().await;
    }

    pub async fn on_tick(&mut self, ms_since_last_tick: u64) {
        self.connection.tick(ms_since_last_tick);
        self.flush().await;
    }

    /// send all segments the connection queued
    pub async fn flush(&mut self) {
        let Some(peer) = self.peer else {
            self.connection.segments_out_mut().clear();
            return;
        };

        while let Some(segment) = self.connection.segments_out_mut().pop_front() {
            let buf = segment.ser(0);
            self.socket.send_datagram(peer, &buf).await;
        }
    }

    /// move received bytes to the application, as far as the channel has room
    fn deliver_inbound(&mut self, inbound: &mut Option<mpsc::Sender<Bytes>>) {
        let Some(sender) = inbound.as_ref() else {
            return;
        };

        while !self.connection.inbound_stream().buffer_empty() {
            match sender.try_reserve() {
                Ok(permit) => {
                    permit.send(self.connection.read(usize::MAX));
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => {
                    let discarded = self.connection.read(usize::MAX);
                    debug!("application stopped reading - discarding {} bytes", discarded.len());
                }
            }
        }

        let stream = self.connection.inbound_stream();
        if stream.eof() || stream.error() {
            trace!("inbound stream finished");
            *inbound = None;
        }
    }

    /// Bind a connection to `socket` and open it towards `peer`. The connection is driven by
    ///  a spawned task until it is closed.
    pub fn spawn_connect(config: UdpAdapterConfig, socket: Arc<UdpSocket>, peer: SocketAddr) -> anyhow::Result<TcpStreamHandle> {
        config.validate()?;

        let mut adapter = TcpOverUdp::new(config.tcp.clone(), Arc::new(socket.clone()), Some(peer));
        adapter.connection.connect();
        Ok(adapter.spawn(config, socket))
    }

    /// Bind a connection to `socket`, accepting the first peer that sends a SYN
    pub fn spawn_listen(config: UdpAdapterConfig, socket: Arc<UdpSocket>) -> anyhow::Result<TcpStreamHandle> {
        config.validate()?;

        let adapter = TcpOverUdp::new(config.tcp.clone(), Arc::new(socket.clone()), None);
        Ok(adapter.spawn(config, socket))
    }

    fn spawn(self, config: UdpAdapterConfig, socket: Arc<UdpSocket>) -> TcpStreamHandle {
        let (command_sender, command_receiver) = mpsc::channel(1);
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.inbound_channel_size);

        let join_handle = tokio::spawn(self.run_loop(config, socket, command_receiver, inbound_sender));

        TcpStreamHandle {
            commands: command_sender,
            inbound: inbound_receiver,
            join_handle,
        }
    }

    async fn run_loop(
        mut self,
        config: UdpAdapterConfig,
        receive_socket: Arc<UdpSocket>,
        mut commands: mpsc::Receiver<Command>,
        inbound: mpsc::Sender<Bytes>,
    ) -> anyhow::Result<()> {
        info!("starting TCP over UDP on {:?}", self.socket.local_addr());

        let mut inbound = Some(inbound);
        let mut buf = vec![0u8; config.max_datagram_size];

        let mut ticks = time::interval(config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        let mut pending_write = Bytes::new();
        let mut commands_open = true;
        let mut write_shutdown_requested = false;
        let mut write_side_closed = false;

        // the SYN of an active open
        self.flush().await;

        loop {
            select! {
                received = receive_socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num_read, from)) => {
                            let correlation_id = Uuid::new_v4();
                            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                            self.on_datagram(from, &buf[..num_read]).instrument(span).await;
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
                _ = ticks.tick() => {
                    let elapsed_millis = last_tick.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
                    last_tick += Duration::from_millis(elapsed_millis);
                    self.on_tick(elapsed_millis).await;
                }
                command = commands.recv(), if commands_open && pending_write.is_empty() => {
                    match command {
                        Some(Command::Write(data)) => pending_write = data,
                        Some(Command::ShutdownWrite) => write_shutdown_requested = true,
                        Some(Command::Abort) => {
                            debug!("aborting connection on application request");
                            self.connection.abort();
                        }
                        None => {
                            debug!("application handle was dropped - closing write side");
                            commands_open = false;
                            write_shutdown_requested = true;
                        }
                    }
                }
            }

            if !pending_write.is_empty() {
                let num_written = self.connection.write(&pending_write);
                pending_write.advance(num_written);
            }
            if write_shutdown_requested && pending_write.is_empty() && !write_side_closed {
                self.connection.end_input_stream();
                write_side_closed = true;
            }

            self.deliver_inbound(&mut inbound);
            self.flush().await;

            match self.connection.state() {
                ConnectionState::Closed => break,
                ConnectionState::Reset => {
                    // buffered bytes are still delivered, the reset shows in the join result
                    self.deliver_remaining(inbound.take()).await;
                    bail!("connection was reset");
                }
                _ => {}
            }
        }

        self.deliver_remaining(inbound.take()).await;
        info!("connection closed");
        Ok(())
    }

    /// hand the rest of the inbound stream to the application, waiting for it to read
    async fn deliver_remaining(&mut self, inbound: Option<mpsc::Sender<Bytes>>) {
        let Some(sender) = inbound else {
            return;
        };

        while !self.connection.inbound_stream().buffer_empty() {
            let data = self.connection.read(usize::MAX);
            if sender.send(data).await.is_err() {
                break;
            }
        }
    }
}

enum Command {
    Write(Bytes),
    ShutdownWrite,
    Abort,
}

/// The application's side of a connection that is driven by [TcpOverUdp]'s spawned event loop
pub struct TcpStreamHandle {
    commands: mpsc::Sender<Command>,
    inbound: mpsc::Receiver<Bytes>,
    join_handle: JoinHandle<anyhow::Result<()>>,
}

impl TcpStreamHandle {
    /// Queue `data` for sending. This waits while previously written data is still waiting
    ///  for room in the connection's outbound stream.
    pub async fn write(&self, data: Bytes) -> anyhow::Result<()> {
        self.send_command(Command::Write(data)).await
    }

    /// close the outbound stream once all written data was handed to the connection
    pub async fn shutdown_write(&self) -> anyhow::Result<()> {
        self.send_command(Command::ShutdownWrite).await
    }

    pub async fn abort(&self) -> anyhow::Result<()> {
        self.send_command(Command::Abort).await
    }

    async fn send_command(&self, command: Command) -> anyhow::Result<()> {
        if self.commands.send(command).await.is_err() {
            bail!("connection is closed");
        }
        Ok(())
    }

    /// The next chunk of bytes received from the peer, or `None` at the end of the stream
    pub async fn read(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Close the write side and discard unread data, and wait for the connection to finish.
    ///  Returns an error if the connection was reset.
    pub async fn join(self) -> anyhow::Result<()> {
        let TcpStreamHandle { commands, inbound, join_handle } = self;
        drop(commands);
        drop(inbound);

        join_handle.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::segment::{TcpFlags, TcpHeader};
    use crate::wrapping_integers::WrappingU32;

    const ISN: WrappingU32 = WrappingU32::new(4000);
    const PEER_ISN: WrappingU32 = WrappingU32::new(9000);

    fn self_addr() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 8))
    }

    fn peer_addr() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    fn tcp_config() -> TcpConfig {
        TcpConfig { fixed_isn: Some(ISN), rt_timeout_millis: 100, ..Default::default() }
    }

    fn datagram(flags: TcpFlags, seqno: WrappingU32, ackno: WrappingU32, payload: &'static [u8]) -> Vec<u8> {
        TcpSegment::new(TcpHeader { seqno, ackno, flags, win: 1000, ..Default::default() }, Bytes::from_static(payload))
            .ser(0)
            .to_vec()
    }

    fn expect_segment(socket: &mut MockDatagramSocket, to: SocketAddr, flags: TcpFlags, seqno: WrappingU32) {
        socket.expect_send_datagram()
            .withf(move |actual_to, buf| {
                let segment = TcpSegment::deser(buf, 0).unwrap();
                actual_to == &to && segment.header.flags == flags && segment.header.seqno == seqno
            })
            .times(1)
            .return_const(());
    }

    #[test]
    fn test_connect_sends_syn_to_peer() {
        let mut socket = MockDatagramSocket::new();
        expect_segment(&mut socket, peer_addr(), TcpFlags::SYN, ISN);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut adapter = TcpOverUdp::new(tcp_config(), Arc::new(socket), Some(peer_addr()));
            adapter.connection_mut().connect();
            adapter.flush().await;
        });
    }

    #[test]
    fn test_listen_accepts_first_syn() {
        let mut socket = MockDatagramSocket::new();
        expect_segment(&mut socket, peer_addr(), TcpFlags::SYN | TcpFlags::ACK, ISN);

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut adapter = TcpOverUdp::new(tcp_config(), Arc::new(socket), None);
            adapter.on_datagram(peer_addr(), &datagram(TcpFlags::SYN, PEER_ISN, WrappingU32::new(0), b"")).await;

            assert_eq!(adapter.peer(), Some(peer_addr()));
            assert_eq!(adapter.connection().state(), ConnectionState::SynReceived);

            // a second peer is not accepted
            adapter.on_datagram(self_addr(), &datagram(TcpFlags::SYN, PEER_ISN, WrappingU32::new(0), b"")).await;
        });
    }

    #[rstest]
    #[case::garbage(vec![1, 2, 3])]
    #[case::bad_checksum({ let mut d = datagram(TcpFlags::SYN, PEER_ISN, WrappingU32::new(0), b"x"); d[20] ^= 1; d })]
    #[case::no_syn(datagram(TcpFlags::ACK, PEER_ISN, ISN, b"x"))]
    fn test_listen_drops_invalid_datagrams(#[case] buf: Vec<u8>) {
        let socket = MockDatagramSocket::new();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut adapter = TcpOverUdp::new(tcp_config(), Arc::new(socket), None);
            adapter.on_datagram(peer_addr(), &buf).await;

            assert_eq!(adapter.peer(), None);
            assert_eq!(adapter.connection().state(), ConnectionState::Listen);
        });
    }

    #[test]
    fn test_tick_retransmits() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send_datagram()
            .times(2)
            .return_const(());

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut adapter = TcpOverUdp::new(tcp_config(), Arc::new(socket), Some(peer_addr()));
            adapter.connection_mut().connect();
            adapter.flush().await;

            adapter.on_tick(99).await;
            adapter.on_tick(1).await;
        });
    }

    #[test]
    fn test_deliver_inbound_respects_channel_capacity() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send_datagram()
            .return_const(());

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut adapter = TcpOverUdp::new(tcp_config(), Arc::new(socket), Some(peer_addr()));
            adapter.connection_mut().connect();
            adapter.on_datagram(peer_addr(), &datagram(TcpFlags::SYN | TcpFlags::ACK, PEER_ISN, ISN + 1, b"")).await;

            let (sender, mut receiver) = mpsc::channel(1);
            let mut inbound = Some(sender);

            adapter.on_datagram(peer_addr(), &datagram(TcpFlags::ACK, PEER_ISN + 1, ISN + 1, b"abc")).await;
            adapter.deliver_inbound(&mut inbound);
            adapter.on_datagram(peer_addr(), &datagram(TcpFlags::ACK, PEER_ISN + 4, ISN + 1, b"de")).await;
            adapter.deliver_inbound(&mut inbound);

            // the channel is full, so "de" stays in the connection
            assert_eq!(adapter.connection().inbound_stream().buffer_size(), 2);
            assert_eq!(receiver.recv().await.unwrap().as_ref(), b"abc");

            adapter.on_datagram(peer_addr(), &datagram(TcpFlags::FIN | TcpFlags::ACK, PEER_ISN + 6, ISN + 1, b"")).await;
            adapter.deliver_inbound(&mut inbound);
            assert_eq!(receiver.recv().await.unwrap().as_ref(), b"de");
            assert!(inbound.is_none());
            assert!(receiver.recv().await.is_none());
        });
    }
}
