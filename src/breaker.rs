/// Counts consecutive rolls (not attempts) that exhausted their retries.
#[derive(Debug, Clone)]
pub struct FailureCircuitBreaker {
    threshold: u32,
    consecutive: u32,
}

impl FailureCircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        FailureCircuitBreaker {
            threshold,
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold() {
        let mut b = FailureCircuitBreaker::new(3);
        assert!(!b.record_failure());
        assert!(!b.record_failure());
        assert!(b.record_failure());
        assert!(b.is_open());
    }

    #[test]
    fn success_resets() {
        let mut b = FailureCircuitBreaker::new(2);
        b.record_failure();
        b.record_success();
        assert_eq!(b.consecutive(), 0);
        assert!(!b.record_failure());
    }
}
