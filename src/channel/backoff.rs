use std::time::Duration;

use random::Source;

/// `(base + jitter) * attempt`, doubled for an inactive application
pub fn retry_delay(base: Duration, jitter: Duration, attempt: u32, active: bool) -> Duration {
    let delay = (base + jitter) * attempt;
    if active {
        delay
    } else {
        delay * 2
    }
}

/// Retry counter of one channel half.
///
/// The jitter is drawn once per retry sequence so delays never shrink.
#[derive(Debug, Default)]
pub struct Backoff {
    count: u32,
    jitter: Option<Duration>,
}

impl Backoff {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.jitter = None;
    }

    pub fn next_delay(
        &mut self,
        base: Duration,
        max_jitter: Duration,
        random: &mut random::Default,
        active: bool,
    ) -> Duration {
        let jitter = *self.jitter.get_or_insert_with(|| {
            let millis = (random.read::<f64>() * max_jitter.as_millis() as f64).floor();
            Duration::from_millis(millis as u64)
        });
        let delay = retry_delay(base, jitter, self.count, active);
        self.count += 1;
        delay
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    const BASE: Duration = Duration::from_millis(5_000);
    const JITTER: Duration = Duration::from_millis(10_000);

    #[test]
    fn first_retry_is_immediate() {
        let mut backoff = Backoff::default();
        let mut random = random::default(3);
        assert_eq!(backoff.next_delay(BASE, JITTER, &mut random, true), Duration::ZERO);
        let second = backoff.next_delay(BASE, JITTER, &mut random, true);
        assert!(second >= BASE && second < BASE + JITTER);
        assert_eq!(backoff.count(), 2);
        backoff.reset();
        assert_eq!(backoff.count(), 0);
    }

    #[test]
    fn inactive_doubles() {
        assert_eq!(
            retry_delay(BASE, Duration::from_millis(1_000), 2, false),
            Duration::from_millis(24_000)
        );
    }

    quickcheck! {
        fn delays_never_shrink(seed: u64, active: bool, retries: u8) -> bool {
            let mut backoff = Backoff::default();
            let mut random = random::default(seed);
            let mut last = Duration::ZERO;
            for _ in 0..(retries % 16) {
                let delay = backoff.next_delay(BASE, JITTER, &mut random, active);
                if delay < last {
                    return false;
                }
                last = delay;
            }
            true
        }
    }
}
