use chrono::{DateTime, Duration, Utc};

/// Monotone estimate of event-time progress: the latest event time seen,
/// minus the allowed lateness. It never moves backwards.
#[derive(Debug, Clone)]
pub struct Watermark {
    lateness: Duration,
    current: Option<DateTime<Utc>>,
}

impl Watermark {
    /// Negative lateness is treated as zero.
    pub fn new(lateness: Duration) -> Self {
        Self {
            lateness: lateness.max(Duration::zero()),
            current: None,
        }
    }

    pub fn with_current(mut self, current: Option<DateTime<Utc>>) -> Self {
        self.current = current;
        self
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.current
    }

    pub fn lateness(&self) -> Duration {
        self.lateness
    }

    /// Fold in an observed event time. Returns true if the watermark moved.
    pub fn observe(&mut self, event_time: DateTime<Utc>) -> bool {
        let candidate = event_time - self.lateness;
        match self.current {
            Some(current) if current >= candidate => false,
            _ => {
                self.current = Some(candidate);
                true
            }
        }
    }

    /// True once the watermark has reached `end`: nothing ending at or
    /// before this point accepts records any more.
    pub fn has_passed(&self, end: DateTime<Utc>) -> bool {
        self.current.map_or(false, |wm| end <= wm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_observe_subtracts_lateness() {
        let mut wm = Watermark::new(Duration::seconds(30));
        assert_eq!(wm.current(), None);
        assert!(wm.observe(at(100)));
        assert_eq!(wm.current(), Some(at(70)));
    }

    #[test]
    fn test_never_moves_backwards() {
        let mut wm = Watermark::new(Duration::seconds(10));
        wm.observe(at(100));
        assert!(!wm.observe(at(50)));
        assert_eq!(wm.current(), Some(at(90)));
        assert!(wm.observe(at(101)));
        assert_eq!(wm.current(), Some(at(91)));
    }

    #[test]
    fn test_negative_lateness_is_zero() {
        let mut wm = Watermark::new(Duration::seconds(-5));
        assert_eq!(wm.lateness(), Duration::zero());
        wm.observe(at(100));
        assert_eq!(wm.current(), Some(at(100)));
    }

    #[test]
    fn test_has_passed() {
        let mut wm = Watermark::new(Duration::zero());
        assert!(!wm.has_passed(at(0)));
        wm.observe(at(60));
        assert!(wm.has_passed(at(60)));
        assert!(!wm.has_passed(at(61)));
    }
}
