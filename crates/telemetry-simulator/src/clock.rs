//! Simulated time source.

use chrono::TimeDelta;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use telemetry_domain::SimTime;

/// Shortest step between ticks, in seconds.
pub const MIN_STEP_SECS: i64 = 30;
/// Longest step between ticks, in seconds.
pub const MAX_STEP_SECS: i64 = 60;

/// Monotonic simulated clock.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    current: SimTime,
    rng: StdRng,
}

impl SimulationClock {
    pub fn new(start: SimTime, rng: StdRng) -> Self {
        Self { current: start, rng }
    }

    /// Reproducible clock.
    pub fn seeded(start: SimTime, seed: u64) -> Self {
        Self::new(start, StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy(start: SimTime) -> Self {
        Self::new(start, StdRng::from_entropy())
    }

    /// Current simulated time without advancing.
    pub fn now(&self) -> SimTime {
        self.current
    }

    /// Advance by a whole number of seconds drawn from `[30, 60]` and return the new time.
    pub fn advance(&mut self) -> SimTime {
        let step = self.rng.gen_range(MIN_STEP_SECS..=MAX_STEP_SECS);
        self.current += TimeDelta::seconds(step);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn start() -> SimTime {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_advance_within_bounds() {
        let mut clock = SimulationClock::seeded(start(), 7);
        let mut previous = clock.now();

        for _ in 0..500 {
            let next = clock.advance();
            let step = (next - previous).num_seconds();
            assert!((MIN_STEP_SECS..=MAX_STEP_SECS).contains(&step), "step {step}");
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_seeded_clocks_agree() {
        let mut a = SimulationClock::seeded(start(), 42);
        let mut b = SimulationClock::seeded(start(), 42);
        for _ in 0..20 {
            assert_eq!(a.advance(), b.advance());
        }
    }

    #[test]
    fn test_now_does_not_advance() {
        let clock = SimulationClock::seeded(start(), 1);
        assert_eq!(clock.now(), start());
        assert_eq!(clock.now(), start());
    }
}
