//! Per-channel minute state machine
//!
//! INGESTING → ANALYZING → OFFSET_AVAILABLE → PRODUCT_PENDING → PRODUCT_WRITTEN
//!
//! A minute whose segment never arrives ends in TIMED_OUT; a minute whose
//! offset is still unavailable at the product deadline ends in NO_PRODUCT.

use hfts_common::time::SECONDS_PER_MINUTE;
use hfts_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle stage of one system-time minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MinuteStage {
    /// Samples arriving, segment not sealed
    Ingesting,
    /// Segment sealed, waiting for Phase-2
    Analyzing,
    /// Measurement appended (any grade)
    OffsetAvailable,
    /// Product attempted, offsets not yet covering the minute
    ProductPending,
    ProductWritten,
    /// Deadline passed without a segment; X-grade record appended
    TimedOut,
    /// Offset never became available for this minute
    NoProduct,
}

impl MinuteStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MinuteStage::ProductWritten | MinuteStage::TimedOut | MinuteStage::NoProduct
        )
    }

    /// Phase-2 has finished with this minute
    pub fn is_analyzed(&self) -> bool {
        !matches!(self, MinuteStage::Ingesting | MinuteStage::Analyzing)
    }

    fn can_advance_to(&self, next: MinuteStage) -> bool {
        use MinuteStage::*;
        matches!(
            (self, next),
            (Ingesting, Analyzing)
                | (Ingesting, TimedOut)
                | (Analyzing, OffsetAvailable)
                | (OffsetAvailable, ProductPending)
                | (OffsetAvailable, ProductWritten)
                | (OffsetAvailable, NoProduct)
                | (ProductPending, ProductWritten)
                | (ProductPending, NoProduct)
        )
    }
}

impl std::fmt::Display for MinuteStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MinuteStage::Ingesting => "INGESTING",
            MinuteStage::Analyzing => "ANALYZING",
            MinuteStage::OffsetAvailable => "OFFSET_AVAILABLE",
            MinuteStage::ProductPending => "PRODUCT_PENDING",
            MinuteStage::ProductWritten => "PRODUCT_WRITTEN",
            MinuteStage::TimedOut => "TIMED_OUT",
            MinuteStage::NoProduct => "NO_PRODUCT",
        };
        write!(f, "{}", s)
    }
}

/// Settled minutes kept individually behind the analysis frontier
pub const RETAINED_MINUTES: i64 = 60;

/// Next unit of Phase-2 work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStep {
    Analyze(i64),
    TimeOut(i64),
}

/// Stage bookkeeping for one channel
#[derive(Debug, Clone, Default)]
pub struct ChannelTracker {
    stages: BTreeMap<i64, MinuteStage>,
    /// Terminal minutes folded out of `stages`, by stage
    settled: BTreeMap<MinuteStage, usize>,
    /// Minutes before this start are settled unless still listed in `stages`
    settled_before: Option<i64>,
    /// Next minute the streaming analysis waits on
    next_analysis: Option<i64>,
    /// End of the latest minute Phase-2 has closed
    analyzed_through: Option<i64>,
    /// Newest ingested system time
    clock: Option<f64>,
}

impl ChannelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, minute_start: i64) -> Option<MinuteStage> {
        self.stages.get(&minute_start).copied()
    }

    pub fn stages(&self) -> &BTreeMap<i64, MinuteStage> {
        &self.stages
    }

    pub fn clock(&self) -> Option<f64> {
        self.clock
    }

    pub fn analyzed_through(&self) -> Option<i64> {
        self.analyzed_through
    }

    /// Number of minutes currently in each stage, settled ones included
    pub fn counts(&self) -> BTreeMap<MinuteStage, usize> {
        let mut counts = self.settled.clone();
        for stage in self.stages.values() {
            *counts.entry(*stage).or_insert(0) += 1;
        }
        counts
    }

    fn is_settled(&self, minute_start: i64) -> bool {
        self.settled_before.map_or(false, |before| minute_start < before)
            && !self.stages.contains_key(&minute_start)
    }

    /// Move a minute forward; unknown minutes may enter at any stage
    pub fn advance(&mut self, minute_start: i64, next: MinuteStage) -> Result<()> {
        if self.is_settled(minute_start) {
            return Err(Error::Internal(format!(
                "Minute {} is already settled, cannot move to {}",
                minute_start, next
            )));
        }
        match self.stages.get(&minute_start) {
            Some(current) if *current == next => Ok(()),
            Some(current) if !current.can_advance_to(next) => Err(Error::Internal(format!(
                "Minute {} cannot move from {} to {}",
                minute_start, current, next
            ))),
            _ => {
                self.stages.insert(minute_start, next);
                if next.is_analyzed() {
                    let end = minute_start + SECONDS_PER_MINUTE;
                    self.analyzed_through = Some(self.analyzed_through.map_or(end, |t| t.max(end)));
                    if next == MinuteStage::OffsetAvailable || next == MinuteStage::TimedOut {
                        if self.next_analysis.map_or(true, |n| n <= minute_start) {
                            self.next_analysis = Some(end);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    pub fn observe_clock(&mut self, system_time: f64) {
        self.clock = Some(self.clock.map_or(system_time, |c| c.max(system_time)));
    }

    /// Mark minutes touched by newly ingested samples
    pub fn ingesting(&mut self, first_minute: i64, last_minute: i64) {
        let mut minute = first_minute;
        while minute <= last_minute {
            if !self.is_settled(minute) {
                self.stages.entry(minute).or_insert(MinuteStage::Ingesting);
            }
            minute += SECONDS_PER_MINUTE;
        }
    }

    /// A segment was sealed; returns false when the minute was already closed
    pub fn archived(&mut self, minute_start: i64) -> bool {
        if self.is_settled(minute_start) {
            return false;
        }
        match self.stage(minute_start) {
            None | Some(MinuteStage::Ingesting) => {
                self.stages.insert(minute_start, MinuteStage::Analyzing);
                if self.next_analysis.is_none() {
                    self.next_analysis = Some(minute_start);
                }
                true
            }
            Some(_) => false,
        }
    }

    /// Fold terminal minutes more than `RETAINED_MINUTES` behind the
    /// analysis frontier into the settled counters; returns how many
    pub fn prune(&mut self) -> usize {
        let frontier = match (self.next_analysis, self.analyzed_through) {
            (Some(cursor), Some(through)) => cursor.min(through),
            _ => return 0,
        };
        let horizon = frontier - RETAINED_MINUTES * SECONDS_PER_MINUTE;
        let settled: Vec<(i64, MinuteStage)> = self
            .stages
            .range(..horizon)
            .filter(|(_, s)| s.is_terminal())
            .map(|(m, s)| (*m, *s))
            .collect();
        for (minute, stage) in &settled {
            self.stages.remove(minute);
            *self.settled.entry(*stage).or_insert(0) += 1;
        }
        if self.settled_before.map_or(true, |before| horizon > before) {
            self.settled_before = Some(horizon);
        }
        settled.len()
    }

    /// Start streaming analysis at `minute_start` if nothing earlier is known
    pub fn resume_at(&mut self, minute_start: i64) {
        if self.next_analysis.map_or(true, |n| minute_start > n) {
            self.next_analysis = Some(minute_start);
        }
    }

    /// Next Phase-2 step, if any is due
    ///
    /// Backlog minutes (sealed behind the streaming cursor) come first. A
    /// missing minute times out once the ingestion clock passes its end plus
    /// `timeout_s`.
    pub fn next_analysis_step(&mut self, timeout_s: f64) -> Option<AnalysisStep> {
        let cursor = self.next_analysis?;
        if let Some((&minute, _)) = self
            .stages
            .range(..cursor)
            .find(|(_, s)| **s == MinuteStage::Analyzing)
        {
            return Some(AnalysisStep::Analyze(minute));
        }

        let mut minute = cursor;
        loop {
            match self.stage(minute) {
                Some(MinuteStage::Analyzing) => return Some(AnalysisStep::Analyze(minute)),
                Some(stage) if stage.is_analyzed() => {
                    minute += SECONDS_PER_MINUTE;
                    self.next_analysis = Some(minute);
                }
                _ => {
                    let deadline = (minute + SECONDS_PER_MINUTE) as f64 + timeout_s;
                    return match self.clock {
                        Some(clock) if clock >= deadline => Some(AnalysisStep::TimeOut(minute)),
                        _ => None,
                    };
                }
            }
        }
    }

    /// Minutes whose product can be attempted now
    ///
    /// A minute is ready once Phase-2 has closed the following minute (so
    /// interpolation can bracket it), once the ingestion clock passes
    /// `latency_s` beyond its end, or unconditionally when `force` is set.
    pub fn product_candidates(&self, latency_s: f64, force: bool) -> Vec<i64> {
        self.stages
            .iter()
            .filter(|(_, s)| {
                matches!(s, MinuteStage::OffsetAvailable | MinuteStage::ProductPending)
            })
            .map(|(m, _)| *m)
            .filter(|m| force || self.product_ready(*m, latency_s))
            .collect()
    }

    fn product_ready(&self, minute_start: i64, latency_s: f64) -> bool {
        let end = minute_start + SECONDS_PER_MINUTE;
        let bracketed = self
            .analyzed_through
            .map_or(false, |t| t >= end + SECONDS_PER_MINUTE);
        bracketed || self.product_deadline_passed(minute_start, latency_s)
    }

    pub fn product_deadline_passed(&self, minute_start: i64, latency_s: f64) -> bool {
        let deadline = (minute_start + SECONDS_PER_MINUTE) as f64 + latency_s;
        self.clock.map_or(false, |c| c >= deadline)
    }
}

/// Snapshot of a channel's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub version: String,
    pub clock: Option<f64>,
    pub counts: BTreeMap<MinuteStage, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: i64 = 1_709_294_400;

    #[test]
    fn test_happy_path_transitions() {
        let mut t = ChannelTracker::new();
        t.ingesting(M, M);
        assert_eq!(t.stage(M), Some(MinuteStage::Ingesting));
        assert!(t.archived(M));
        assert_eq!(t.next_analysis_step(60.0), Some(AnalysisStep::Analyze(M)));
        t.advance(M, MinuteStage::OffsetAvailable).unwrap();
        t.advance(M, MinuteStage::ProductPending).unwrap();
        t.advance(M, MinuteStage::ProductWritten).unwrap();
        assert!(t.stage(M).unwrap().is_terminal());
        assert!(t.advance(M, MinuteStage::Analyzing).is_err());
    }

    #[test]
    fn test_missing_minute_times_out_on_data_clock() {
        let mut t = ChannelTracker::new();
        t.archived(M);
        t.advance(M, MinuteStage::OffsetAvailable).unwrap();

        // Minute M+60 never sealed; clock just short of the deadline
        t.observe_clock((M + 120) as f64 + 59.0);
        assert_eq!(t.next_analysis_step(60.0), None);
        t.observe_clock((M + 180) as f64);
        assert_eq!(t.next_analysis_step(60.0), Some(AnalysisStep::TimeOut(M + 60)));
        t.advance(M + 60, MinuteStage::TimedOut).unwrap();
        assert_eq!(t.next_analysis_step(60.0), None);
    }

    #[test]
    fn test_late_segment_after_timeout_is_ignored() {
        let mut t = ChannelTracker::new();
        t.advance(M, MinuteStage::TimedOut).unwrap();
        assert!(!t.archived(M));
        assert_eq!(t.stage(M), Some(MinuteStage::TimedOut));
    }

    #[test]
    fn test_backlog_before_cursor_is_analyzed_first() {
        let mut t = ChannelTracker::new();
        t.resume_at(M + 600);
        t.archived(M + 600);
        t.archived(M);
        assert_eq!(t.next_analysis_step(60.0), Some(AnalysisStep::Analyze(M)));
        t.advance(M, MinuteStage::OffsetAvailable).unwrap();
        assert_eq!(t.next_analysis_step(60.0), Some(AnalysisStep::Analyze(M + 600)));
    }

    #[test]
    fn test_product_waits_for_following_minute() {
        let mut t = ChannelTracker::new();
        t.archived(M);
        t.advance(M, MinuteStage::OffsetAvailable).unwrap();
        assert!(t.product_candidates(120.0, false).is_empty());
        assert_eq!(t.product_candidates(120.0, true), vec![M]);

        t.archived(M + 60);
        t.advance(M + 60, MinuteStage::OffsetAvailable).unwrap();
        assert_eq!(t.product_candidates(120.0, false), vec![M]);
    }

    #[test]
    fn test_product_latency_deadline() {
        let mut t = ChannelTracker::new();
        t.archived(M);
        t.advance(M, MinuteStage::OffsetAvailable).unwrap();
        t.observe_clock((M + 60) as f64 + 119.0);
        assert!(t.product_candidates(120.0, false).is_empty());
        t.observe_clock((M + 60) as f64 + 120.0);
        assert_eq!(t.product_candidates(120.0, false), vec![M]);
    }

    #[test]
    fn test_counts() {
        let mut t = ChannelTracker::new();
        t.ingesting(M, M + 120);
        t.archived(M);
        let counts = t.counts();
        assert_eq!(counts[&MinuteStage::Ingesting], 2);
        assert_eq!(counts[&MinuteStage::Analyzing], 1);
        assert_eq!(MinuteStage::OffsetAvailable.to_string(), "OFFSET_AVAILABLE");
    }

    #[test]
    fn test_settled_minutes_are_folded_into_counts() {
        let mut t = ChannelTracker::new();
        let minutes = 24 * 60;
        for k in 0..minutes {
            let minute = M + k * 60;
            t.ingesting(minute, minute);
            t.archived(minute);
            assert_eq!(t.next_analysis_step(60.0), Some(AnalysisStep::Analyze(minute)));
            t.advance(minute, MinuteStage::OffsetAvailable).unwrap();
            if k > 0 {
                t.advance(minute - 60, MinuteStage::ProductWritten).unwrap();
            }
            t.prune();
            assert!(t.stages().len() <= RETAINED_MINUTES as usize + 2, "{}", t.stages().len());
        }

        let counts = t.counts();
        assert_eq!(counts[&MinuteStage::ProductWritten], minutes as usize - 1);
        assert_eq!(counts[&MinuteStage::OffsetAvailable], 1);
        assert_eq!(counts.values().sum::<usize>(), minutes as usize);

        // Recent history stays visible, old history is closed to late data
        let recent = M + (minutes - 2) * 60;
        assert_eq!(t.stage(recent), Some(MinuteStage::ProductWritten));
        assert_eq!(t.stage(M), None);
        assert!(!t.archived(M));
        t.ingesting(M, M);
        assert_eq!(t.stage(M), None);
        assert!(t.advance(M, MinuteStage::Analyzing).is_err());
        assert_eq!(t.product_candidates(120.0, true), vec![M + (minutes - 1) * 60]);
    }

    #[test]
    fn test_prune_keeps_unfinished_minutes() {
        let mut t = ChannelTracker::new();
        t.archived(M);
        t.advance(M, MinuteStage::OffsetAvailable).unwrap();
        for k in 1..200 {
            let minute = M + k * 60;
            t.archived(minute);
            t.advance(minute, MinuteStage::OffsetAvailable).unwrap();
            t.advance(minute, MinuteStage::ProductWritten).unwrap();
        }
        assert!(t.prune() > 0);
        assert_eq!(t.stage(M), Some(MinuteStage::OffsetAvailable));
        assert_eq!(t.product_candidates(120.0, true), vec![M]);
        t.advance(M, MinuteStage::NoProduct).unwrap();
        assert_eq!(t.prune(), 1);
        assert_eq!(t.counts()[&MinuteStage::NoProduct], 1);
    }
}
