//! Utilities for testing code that uses [TcpConnection]s. They are used by this crate's own
//!  tests, and they are exported so applications can test their protocol handling without
//!  real sockets.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::trace;
use crate::connection::TcpConnection;
use crate::segment::TcpSegment;

/// A simulated network between two connections that loses, duplicates and reorders segments.
///  Randomness comes from a seeded RNG, so every run with the same seed behaves the same.
///
/// Segments go through the wire format on their way, so the codec is exercised as well.
pub struct SimulatedLink {
    rng: StdRng,
    loss_rate: f64,
    duplication_rate: f64,
    reorder: bool,
}

impl SimulatedLink {
    pub fn new(seed: u64, loss_rate: f64, duplication_rate: f64, reorder: bool) -> SimulatedLink {
        assert!((0.0..=1.0).contains(&loss_rate));
        assert!((0.0..=1.0).contains(&duplication_rate));

        SimulatedLink {
            rng: StdRng::seed_from_u64(seed),
            loss_rate,
            duplication_rate,
            reorder,
        }
    }

    pub fn perfect() -> SimulatedLink {
        SimulatedLink::new(0, 0.0, 0.0, false)
    }

    /// Take all segments the connections sent, and deliver those that survive the link.
    ///  Returns the number of delivered segments.
    pub fn exchange(&mut self, a: &mut TcpConnection, b: &mut TcpConnection) -> usize {
        let a_to_b = self.transmit(a);
        let b_to_a = self.transmit(b);

        for segment in &a_to_b {
            b.segment_received(segment);
        }
        for segment in &b_to_a {
            a.segment_received(segment);
        }
        a_to_b.len() + b_to_a.len()
    }

    fn transmit(&mut self, from: &mut TcpConnection) -> Vec<TcpSegment> {
        let mut result = Vec::new();

        while let Some(segment) = from.segments_out_mut().pop_front() {
            let buf = segment.ser(0);
            let segment = TcpSegment::deser(&buf, 0)
                .expect("a serialized segment should be parseable");

            if self.rng.gen_bool(self.loss_rate) {
                trace!("simulated link: dropping {:?}", segment);
                continue;
            }
            if self.rng.gen_bool(self.duplication_rate) {
                result.push(segment.clone());
            }
            result.push(segment);
        }

        if self.reorder {
            result.shuffle(&mut self.rng);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpConfig;
    use crate::state::ConnectionState;

    #[test]
    fn test_perfect_link_handshake() {
        let mut a = TcpConnection::new(TcpConfig::default());
        let mut b = TcpConnection::new(TcpConfig::default());
        a.connect();

        let mut link = SimulatedLink::perfect();
        assert_eq!(link.exchange(&mut a, &mut b), 1);
        assert_eq!(link.exchange(&mut a, &mut b), 1);
        assert_eq!(link.exchange(&mut a, &mut b), 1);
        assert_eq!(link.exchange(&mut a, &mut b), 0);

        assert_eq!(a.state(), ConnectionState::Established);
        assert_eq!(b.state(), ConnectionState::Established);
    }

    #[test]
    fn test_total_loss() {
        let mut a = TcpConnection::new(TcpConfig::default());
        let mut b = TcpConnection::new(TcpConfig::default());
        a.connect();

        let mut link = SimulatedLink::new(5, 1.0, 0.0, false);
        assert_eq!(link.exchange(&mut a, &mut b), 0);
        assert_eq!(b.state(), ConnectionState::Listen);
    }

    #[test]
    fn test_duplication() {
        let mut a = TcpConnection::new(TcpConfig::default());
        let mut b = TcpConnection::new(TcpConfig::default());
        a.connect();

        let mut link = SimulatedLink::new(5, 0.0, 1.0, false);
        assert_eq!(link.exchange(&mut a, &mut b), 2);
        assert_eq!(b.state(), ConnectionState::SynReceived);
    }
}
