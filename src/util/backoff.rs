use std::cmp::min;
use std::time::Duration;

/// Capped exponential backoff as a pure function of the number of tries so far. The factor is
///  expressed in eighths to stay in integer arithmetic, e.g. 16 doubles the delay per try and
///  12 multiplies it by 1.5.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor_eighths: u32,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration, factor_eighths: u32) -> Backoff {
        assert!(factor_eighths >= 8);
        Backoff {
            initial,
            max,
            factor_eighths,
        }
    }

    #[must_use]
    pub fn delay(&self, tries: u64) -> Duration {
        let max_millis = self.max.as_millis() as u64;
        let mut millis = min(self.initial.as_millis() as u64, max_millis);

        for _ in 0..tries {
            if millis >= max_millis {
                break;
            }
            millis = millis.saturating_mul(self.factor_eighths as u64) >> 3;
        }

        Duration::from_millis(min(millis, max_millis))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(10), Duration::from_secs(60 * 60), 16)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::initial(0, 10)]
    #[case::first(1, 20)]
    #[case::second(2, 40)]
    #[case::eighth(8, 2560)]
    #[case::capped(9, 3600)]
    #[case::far_beyond_cap(1_000_000, 3600)]
    fn test_delay_default(#[case] tries: u64, #[case] expected_secs: u64) {
        assert_eq!(Backoff::default().delay(tries), Duration::from_secs(expected_secs));
    }

    #[rstest]
    #[case::factor_1_5(12)]
    #[case::factor_1(8)]
    #[case::factor_2(16)]
    #[case::factor_3(24)]
    fn test_delay_is_monotonic(#[case] factor_eighths: u32) {
        let backoff = Backoff::new(Duration::from_millis(7), Duration::from_secs(100), factor_eighths);
        let mut prev = Duration::ZERO;
        for tries in 0..200 {
            let delay = backoff.delay(tries);
            assert!(delay >= prev, "{:?} < {:?} for {} tries", delay, prev, tries);
            assert!(delay <= backoff.max);
            prev = delay;
        }
    }

    #[test]
    fn test_initial_above_max() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1), 16);
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
    }
}
