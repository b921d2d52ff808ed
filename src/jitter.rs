//! Jitter applied to computed backoff delays.
//!
//! - `None`: exact delays. Default, so configured schedules are observed as written.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while spreading retries.
//!
//! Provider-mandated waits (`Retry-After`) are never jittered; see [`crate::retry`].

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    #[default]
    None,
    /// Random between 0 and the delay.
    Full,
    /// Random between half the delay and the delay.
    Equal,
}

impl Jitter {
    /// Apply jitter using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-provided RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            Jitter::Full if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal if millis == 0 => Duration::ZERO,
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(5);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn full_jitter_is_between_zero_and_delay() {
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(delay) <= delay);
        }
    }

    #[test]
    fn equal_jitter_keeps_half_the_delay() {
        let delay = Duration::from_secs(1);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let jittered = Jitter::Equal.apply_with_rng(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn deserializes_from_lowercase_names() {
        #[derive(Deserialize)]
        struct Holder {
            jitter: Jitter,
        }
        let holder: Holder = toml::from_str("jitter = \"equal\"").unwrap();
        assert_eq!(holder.jitter, Jitter::Equal);
    }
}
