//! Event-time watermark with a fixed lateness bound.
//!
//! `watermark = max(event_time seen) - lateness`. It only moves forward.

use chrono::TimeDelta;

use telemetry_domain::SimTime;

/// Default allowed lateness: two minutes.
pub const DEFAULT_LATENESS: TimeDelta = TimeDelta::minutes(2);

/// Whether an arriving record may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Older than the watermark; dropped.
    Late { watermark: SimTime },
}

/// Watermark state of one topic
#[derive(Debug, Clone)]
pub struct WatermarkPolicy {
    lateness: TimeDelta,
    max_event_time: Option<SimTime>,
}

impl WatermarkPolicy {
    #[must_use]
    pub const fn new(lateness: TimeDelta) -> Self {
        Self {
            lateness,
            max_event_time: None,
        }
    }

    /// Fold `event_time` into the watermark, then decide admission.
    pub fn observe(&mut self, event_time: SimTime) -> Admission {
        let max = self
            .max_event_time
            .map_or(event_time, |current| current.max(event_time));
        self.max_event_time = Some(max);

        let watermark = max - self.lateness;
        if event_time >= watermark {
            Admission::Admitted
        } else {
            Admission::Late { watermark }
        }
    }

    /// `None` until the first record is observed
    #[must_use]
    pub fn watermark(&self) -> Option<SimTime> {
        self.max_event_time.map(|max| max - self.lateness)
    }

    #[must_use]
    pub const fn max_event_time(&self) -> Option<SimTime> {
        self.max_event_time
    }

    #[must_use]
    pub const fn lateness(&self) -> TimeDelta {
        self.lateness
    }

    /// Reset to the state persisted in a checkpoint.
    pub fn restore(&mut self, max_event_time: Option<SimTime>) {
        self.max_event_time = max_event_time;
    }
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LATENESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t0() -> SimTime {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_late_record_dropped_and_recent_admitted() {
        let mut policy = WatermarkPolicy::default();
        assert_eq!(policy.observe(t0()), Admission::Admitted);
        let watermark = policy.watermark().unwrap();
        assert_eq!(watermark, t0() - TimeDelta::minutes(2));

        let late = watermark - TimeDelta::minutes(3);
        assert_eq!(policy.observe(late), Admission::Late { watermark });

        let recent = watermark + TimeDelta::seconds(1);
        assert_eq!(policy.observe(recent), Admission::Admitted);

        assert_eq!(policy.observe(watermark), Admission::Admitted);
    }

    #[test]
    fn test_watermark_never_decreases() {
        let mut policy = WatermarkPolicy::default();
        let offsets = [0, 45, 30, 200, 10, 190, 260, 5];
        let mut previous = None;

        for secs in offsets {
            policy.observe(t0() + TimeDelta::seconds(secs));
            let current = policy.watermark();
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(previous, Some(t0() + TimeDelta::seconds(260) - DEFAULT_LATENESS));
    }

    #[test]
    fn test_restore_resumes_from_checkpoint() {
        let mut policy = WatermarkPolicy::new(TimeDelta::seconds(30));
        assert!(policy.watermark().is_none());

        policy.restore(Some(t0()));
        assert_eq!(policy.watermark(), Some(t0() - TimeDelta::seconds(30)));
        assert!(matches!(
            policy.observe(t0() - TimeDelta::seconds(31)),
            Admission::Late { .. }
        ));
    }
}
