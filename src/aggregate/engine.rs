//! Windowed aggregation state machine.
//!
//! A window is created lazily by its first record (`OPEN`). Once the
//! watermark reaches its end it stops accepting records (`FINALIZING`) and is
//! handed out by [`WindowedAggregator::ready_windows`]; it is evicted only once
//! its output is written. Records mapping only to finalizing or evicted
//! windows are late and dropped.

use super::watermark::Watermark;
use super::window::{WindowAssigner, WindowBounds, WindowError, WindowState};
use crate::record::{Record, RecordError, WindowAggregate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Window(#[from] WindowError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Merged into this many open windows.
    Accepted { windows: usize },
    /// Every window the record maps to has already finalized.
    LateDropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub ingested: u64,
    pub late_dropped: u64,
    pub windows_emitted: u64,
}

/// A window removed from the engine once the watermark passed its end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizedWindow {
    pub bounds: WindowBounds,
    pub state: WindowState,
}

impl FinalizedWindow {
    pub fn to_aggregate(&self) -> Option<WindowAggregate> {
        self.state
            .average()
            .map(|avg| WindowAggregate::new(self.bounds.start, self.bounds.end, avg))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenWindowSnapshot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sum: f64,
    pub count: u64,
}

/// Serializable engine state: open windows, watermark and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub watermark: Option<DateTime<Utc>>,
    pub open_windows: Vec<OpenWindowSnapshot>,
    pub stats: EngineStats,
}

pub struct WindowedAggregator {
    assigner: WindowAssigner,
    watermark: Watermark,
    open: BTreeMap<WindowBounds, WindowState>,
    stats: EngineStats,
}

impl WindowedAggregator {
    pub fn new(assigner: WindowAssigner, allowed_lateness: chrono::Duration) -> Self {
        Self {
            assigner,
            watermark: Watermark::new(allowed_lateness),
            open: BTreeMap::new(),
            stats: EngineStats::default(),
        }
    }

    /// Rebuild an engine from a snapshot taken with the same window settings.
    pub fn restore(
        assigner: WindowAssigner,
        allowed_lateness: chrono::Duration,
        snapshot: EngineSnapshot,
    ) -> Self {
        let open = snapshot
            .open_windows
            .into_iter()
            .map(|w| {
                (
                    WindowBounds {
                        start: w.start,
                        end: w.end,
                    },
                    WindowState {
                        sum: w.sum,
                        count: w.count,
                    },
                )
            })
            .collect();

        Self {
            assigner,
            watermark: Watermark::new(allowed_lateness).with_current(snapshot.watermark),
            open,
            stats: snapshot.stats,
        }
    }

    pub fn ingest(&mut self, record: &Record) -> Result<IngestOutcome, EngineError> {
        let (event_time, score) = record.scored_event()?;
        let outcome = self.ingest_event(event_time, score)?;
        if outcome == IngestOutcome::LateDropped {
            tracing::debug!(
                record_id = %record.id,
                event_time = %event_time,
                watermark = ?self.watermark.current(),
                "Dropping late record"
            );
        }
        Ok(outcome)
    }

    pub fn ingest_event(
        &mut self,
        event_time: DateTime<Utc>,
        score: f64,
    ) -> Result<IngestOutcome, EngineError> {
        let windows = self.assigner.assign(event_time)?;

        // Lateness is judged against the watermark before this record moves it.
        let mut accepted = 0;
        for bounds in windows {
            if self.watermark.has_passed(bounds.end) {
                continue;
            }
            self.open.entry(bounds).or_default().merge(score);
            accepted += 1;
        }

        self.watermark.observe(event_time);

        if accepted == 0 {
            self.stats.late_dropped += 1;
            Ok(IngestOutcome::LateDropped)
        } else {
            self.stats.ingested += 1;
            Ok(IngestOutcome::Accepted { windows: accepted })
        }
    }

    /// Every window the watermark has passed, oldest first. The windows stay
    /// in the engine until [`evict`](Self::evict) is called for them.
    pub fn ready_windows(&self) -> Vec<FinalizedWindow> {
        let Some(watermark) = self.watermark.current() else {
            return Vec::new();
        };

        // Windows share one size, so ordering by start also orders by end.
        self.open
            .iter()
            .take_while(|(bounds, _)| bounds.end <= watermark)
            .map(|(bounds, state)| FinalizedWindow {
                bounds: *bounds,
                state: *state,
            })
            .collect()
    }

    /// Drop windows whose output has been written and count them as emitted.
    /// Returns how many were still open.
    pub fn evict(&mut self, emitted: &[FinalizedWindow]) -> usize {
        let removed = emitted
            .iter()
            .filter(|w| self.open.remove(&w.bounds).is_some())
            .count();
        self.stats.windows_emitted += removed as u64;
        removed
    }

    /// Remove and return every window the watermark has passed, oldest first.
    pub fn drain_ready(&mut self) -> Vec<FinalizedWindow> {
        let ready = self.ready_windows();
        self.evict(&ready);
        ready
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark.current()
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            watermark: self.watermark.current(),
            open_windows: self
                .open
                .iter()
                .map(|(bounds, state)| OpenWindowSnapshot {
                    start: bounds.start,
                    end: bounds.end,
                    sum: state.sum,
                    count: state.count,
                })
                .collect(),
            stats: self.stats,
        }
    }
}
