//! Event-time window assignment.
//!
//! Window starts are aligned to the Unix epoch: a record at time `t` falls in
//! the tumbling window starting at `floor(t / size) * size`. With a slide
//! smaller than the size, each record falls in `size / slide` overlapping
//! windows.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window size must be positive")]
    ZeroSize,

    #[error("window slide must be positive and not larger than the window size")]
    InvalidSlide,

    #[error("timestamp out of range: {0} ms")]
    OutOfRange(i64),
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Running sum and count of scores merged into one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub sum: f64,
    pub count: u64,
}

impl WindowState {
    pub fn merge(&mut self, score: f64) {
        self.sum += score;
        self.count += 1;
    }

    /// `None` for a window that never received a record.
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    size_ms: i64,
    slide_ms: i64,
}

impl WindowAssigner {
    pub fn tumbling(size: Duration) -> Result<Self, WindowError> {
        Self::new(size, None)
    }

    pub fn new(size: Duration, slide: Option<Duration>) -> Result<Self, WindowError> {
        let size_ms = i64::try_from(size.as_millis()).map_err(|_| WindowError::ZeroSize)?;
        if size_ms <= 0 {
            return Err(WindowError::ZeroSize);
        }
        let slide_ms = match slide {
            Some(slide) => {
                let slide_ms =
                    i64::try_from(slide.as_millis()).map_err(|_| WindowError::InvalidSlide)?;
                if slide_ms <= 0 || slide_ms > size_ms {
                    return Err(WindowError::InvalidSlide);
                }
                slide_ms
            }
            None => size_ms,
        };
        Ok(Self { size_ms, slide_ms })
    }

    pub fn size(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.size_ms)
    }

    pub fn is_tumbling(&self) -> bool {
        self.size_ms == self.slide_ms
    }

    /// Every window containing `t`, ordered by start.
    pub fn assign(&self, t: DateTime<Utc>) -> Result<Vec<WindowBounds>, WindowError> {
        let ts = t.timestamp_millis();
        let last_start = ts.div_euclid(self.slide_ms) * self.slide_ms;

        let mut windows = Vec::with_capacity((self.size_ms / self.slide_ms) as usize);
        let mut start = last_start;
        while start > ts - self.size_ms {
            windows.push(self.bounds_at(start)?);
            start -= self.slide_ms;
        }
        windows.reverse();
        Ok(windows)
    }

    fn bounds_at(&self, start_ms: i64) -> Result<WindowBounds, WindowError> {
        let start = Utc
            .timestamp_millis_opt(start_ms)
            .single()
            .ok_or(WindowError::OutOfRange(start_ms))?;
        let end = Utc
            .timestamp_millis_opt(start_ms + self.size_ms)
            .single()
            .ok_or(WindowError::OutOfRange(start_ms + self.size_ms))?;
        Ok(WindowBounds { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_tumbling_alignment() {
        let assigner = WindowAssigner::tumbling(Duration::from_secs(60)).unwrap();

        let windows = assigner.assign(at(125)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, at(120));
        assert_eq!(windows[0].end, at(180));

        // The end is exclusive.
        assert_eq!(assigner.assign(at(180)).unwrap()[0].start, at(180));
        assert_eq!(assigner.assign(at(179)).unwrap()[0].start, at(120));
    }

    #[test]
    fn test_same_window_for_whole_interval() {
        let assigner = WindowAssigner::tumbling(Duration::from_secs(60)).unwrap();
        let expected = assigner.assign(at(600)).unwrap();
        for offset in [0, 1, 30, 59] {
            assert_eq!(assigner.assign(at(600 + offset)).unwrap(), expected);
        }
    }

    #[test]
    fn test_pre_epoch_floors_downward() {
        let assigner = WindowAssigner::tumbling(Duration::from_secs(60)).unwrap();
        let windows = assigner.assign(at(-1)).unwrap();
        assert_eq!(windows[0].start, at(-60));
        assert_eq!(windows[0].end, at(0));
    }

    #[test]
    fn test_hopping_windows() {
        let assigner =
            WindowAssigner::new(Duration::from_secs(60), Some(Duration::from_secs(20))).unwrap();
        assert!(!assigner.is_tumbling());

        let windows = assigner.assign(at(125)).unwrap();
        let starts: Vec<_> = windows.iter().map(|w| w.start).collect();
        assert_eq!(starts, vec![at(80), at(100), at(120)]);
        assert!(windows.iter().all(|w| w.contains(at(125))));
    }

    #[test]
    fn test_invalid_sizes() {
        assert_eq!(
            WindowAssigner::tumbling(Duration::ZERO),
            Err(WindowError::ZeroSize)
        );
        assert_eq!(
            WindowAssigner::new(Duration::from_secs(10), Some(Duration::from_secs(20))),
            Err(WindowError::InvalidSlide)
        );
    }

    #[test]
    fn test_state_average() {
        let mut state = WindowState::default();
        assert_eq!(state.average(), None);
        state.merge(2.0);
        state.merge(4.0);
        assert_eq!(state.average(), Some(3.0));
    }
}
