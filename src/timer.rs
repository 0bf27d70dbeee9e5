/// Retransmission timer with exponential backoff. It has no notion of wall-clock time: the owner
///  passes in elapsed milliseconds explicitly.
#[derive(Debug)]
pub struct RetransmissionTimer {
    initial_timeout: u64,
    timeout: u64,
    elapsed: u64,
}

impl RetransmissionTimer {
    pub fn new(initial_timeout_millis: u64) -> RetransmissionTimer {
        RetransmissionTimer {
            initial_timeout: initial_timeout_millis,
            timeout: initial_timeout_millis,
            elapsed: 0,
        }
    }

    /// back to the initial timeout, starting to count from zero
    pub fn reset(&mut self) {
        self.timeout = self.initial_timeout;
        self.elapsed = 0;
    }

    /// start counting from zero, keeping the current timeout
    pub fn restart(&mut self) {
        self.elapsed = 0;
    }

    pub fn advance(&mut self, millis: u64) {
        self.elapsed = self.elapsed.saturating_add(millis);
    }

    pub fn expired(&self) -> bool {
        self.elapsed >= self.timeout
    }

    pub fn back_off(&mut self) {
        self.timeout = self.timeout.saturating_mul(2);
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fresh(1000, 0, 999, false)]
    #[case::exact(1000, 0, 1000, true)]
    #[case::accumulated(1000, 600, 400, true)]
    #[case::after_back_off(2000, 1000, 999, false)]
    #[case::saturating(1000, u64::MAX, 1, true)]
    fn test_expired(#[case] timeout: u64, #[case] elapsed: u64, #[case] advance: u64, #[case] expected: bool) {
        let mut timer = RetransmissionTimer { initial_timeout: 1000, timeout, elapsed };
        timer.advance(advance);
        assert_eq!(timer.expired(), expected);
    }

    #[test]
    fn test_back_off_and_reset() {
        let mut timer = RetransmissionTimer::new(100);
        timer.advance(150);
        timer.back_off();
        timer.restart();
        assert_eq!(timer.timeout(), 200);
        assert!(!timer.expired());

        timer.back_off();
        assert_eq!(timer.timeout(), 400);

        timer.advance(50);
        timer.reset();
        assert_eq!(timer.timeout(), 100);
        assert!(!timer.expired());
        timer.advance(100);
        assert!(timer.expired());
    }

    #[test]
    fn test_back_off_saturates() {
        let mut timer = RetransmissionTimer { initial_timeout: 1, timeout: u64::MAX - 1, elapsed: 0 };
        timer.back_off();
        assert_eq!(timer.timeout(), u64::MAX);
    }
}
