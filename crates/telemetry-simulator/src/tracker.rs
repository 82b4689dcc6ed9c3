//! Vehicle position tracking.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use telemetry_domain::{Increments, Position};

pub use telemetry_domain::reached;

/// Half-width of the per-axis uniform jitter, in degrees.
pub const JITTER_DEG: f64 = 0.0005;

/// Owns the vehicle's current position.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    position: Position,
    rng: StdRng,
}

impl PositionTracker {
    pub fn new(start: Position, rng: StdRng) -> Self {
        Self {
            position: start,
            rng,
        }
    }

    pub fn seeded(start: Position, seed: u64) -> Self {
        Self::new(start, StdRng::seed_from_u64(seed))
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Move by `increments` plus independent jitter on each axis, store and return the result.
    pub fn advance(&mut self, increments: Increments) -> Position {
        let lat_jitter = self.rng.gen_range(-JITTER_DEG..=JITTER_DEG);
        let lon_jitter = self.rng.gen_range(-JITTER_DEG..=JITTER_DEG);

        self.position = Position::new(
            self.position.latitude + increments.latitude + lat_jitter,
            self.position.longitude + increments.longitude + lon_jitter,
        );
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Increments = Increments {
        latitude: 0.01,
        longitude: -0.01,
    };

    #[test]
    fn test_advance_applies_increment_and_jitter() {
        let mut tracker = PositionTracker::seeded(Position::new(51.5, -0.1), 3);

        for _ in 0..200 {
            let before = tracker.position();
            let after = tracker.advance(STEP);
            let dlat = after.latitude - before.latitude - STEP.latitude;
            let dlon = after.longitude - before.longitude - STEP.longitude;
            assert!(dlat.abs() <= JITTER_DEG + 1e-12, "lat jitter {dlat}");
            assert!(dlon.abs() <= JITTER_DEG + 1e-12, "lon jitter {dlon}");
            assert_eq!(after, tracker.position());
        }
    }

    #[test]
    fn test_reaches_north_west_corner() {
        let destination = Position::new(51.6, -0.2);
        let mut tracker = PositionTracker::seeded(Position::new(51.5, -0.1), 9);

        let mut moves = 0;
        while !reached(&tracker.position(), &destination) {
            tracker.advance(STEP);
            moves += 1;
            assert!(moves < 20);
        }
        assert!((9..=12).contains(&moves), "moves {moves}");
    }
}
