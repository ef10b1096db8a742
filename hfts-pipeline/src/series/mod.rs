//! Clock offset series
//!
//! A series is the ordered set of measurements for one (channel, version).
//! Versions are independent namespaces: a new algorithm version starts an
//! empty series and never touches older ones.
//!
//! Lookups interpolate linearly between the bracketing usable measurements.
//! Outside the measured range, or across a hole wider than the staleness
//! window, the lookup reports [`OffsetLookup::Unavailable`] instead of
//! extrapolating.

pub mod store;

pub use store::{SeriesStore, SeriesVersionInfo, SeriesWriter};

use hfts_common::model::{ClockOffsetMeasurement, QualityGrade};
use hfts_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of an offset lookup at one system time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OffsetLookup {
    /// Between two usable measurements (or exactly on one)
    Interpolated { offset_ms: f64, uncertainty_ms: f64 },
    /// Before the first or after the last usable measurement, within the
    /// staleness window
    Held {
        offset_ms: f64,
        uncertainty_ms: f64,
        age_s: f64,
    },
    Unavailable,
}

impl OffsetLookup {
    pub fn offset_ms(&self) -> Option<f64> {
        match self {
            OffsetLookup::Interpolated { offset_ms, .. } | OffsetLookup::Held { offset_ms, .. } => {
                Some(*offset_ms)
            }
            OffsetLookup::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, OffsetLookup::Unavailable)
    }
}

/// Counts per quality grade
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradeDistribution {
    pub total: usize,
    pub counts: BTreeMap<QualityGrade, usize>,
}

impl GradeDistribution {
    pub fn count(&self, grade: QualityGrade) -> usize {
        self.counts.get(&grade).copied().unwrap_or(0)
    }

    /// Share of A and B grades; 0 for an empty distribution
    pub fn fraction_ab(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.count(QualityGrade::A) + self.count(QualityGrade::B)) as f64 / self.total as f64
    }
}

/// In-memory view of one series version
#[derive(Debug, Clone)]
pub struct ClockOffsetSeries {
    channel: String,
    version: String,
    staleness_window_s: f64,
    /// Ordered by `utc_time`
    measurements: Vec<ClockOffsetMeasurement>,
    /// Indices of usable measurements, ordered by `system_time`
    usable: Vec<usize>,
}

impl ClockOffsetSeries {
    pub fn new(channel: &str, version: &str, staleness_window_s: f64) -> Self {
        Self {
            channel: channel.to_string(),
            version: version.to_string(),
            staleness_window_s,
            measurements: Vec::new(),
            usable: Vec::new(),
        }
    }

    pub fn from_measurements(
        channel: &str,
        version: &str,
        staleness_window_s: f64,
        measurements: Vec<ClockOffsetMeasurement>,
    ) -> Result<Self> {
        let mut measurements = measurements;
        measurements.sort_by(|a, b| a.utc_time.total_cmp(&b.utc_time));
        if let Some(pair) = measurements.windows(2).find(|w| w[0].utc_time == w[1].utc_time) {
            return Err(Error::InvalidInput(format!(
                "{}/{} already has a measurement for {}",
                channel, version, pair[1].utc_time
            )));
        }
        let mut series = Self::new(channel, version, staleness_window_s);
        series.measurements = measurements;
        series.reindex();
        Ok(series)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn staleness_window_s(&self) -> f64 {
        self.staleness_window_s
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn measurements(&self) -> &[ClockOffsetMeasurement] {
        &self.measurements
    }

    /// Measurement recorded for a UTC minute
    pub fn at_minute(&self, utc_time: f64) -> Option<&ClockOffsetMeasurement> {
        self.measurements
            .binary_search_by(|m| m.utc_time.total_cmp(&utc_time))
            .ok()
            .map(|i| &self.measurements[i])
    }

    /// Add a measurement; each UTC minute may be recorded once
    pub fn insert(&mut self, measurement: ClockOffsetMeasurement) -> Result<()> {
        let pos = match self
            .measurements
            .binary_search_by(|m| m.utc_time.total_cmp(&measurement.utc_time))
        {
            Ok(_) => {
                return Err(Error::InvalidInput(format!(
                    "{}/{} already has a measurement for {}",
                    self.channel, self.version, measurement.utc_time
                )))
            }
            Err(pos) => pos,
        };
        let usable = measurement.is_usable();
        let system_time = measurement.system_time;
        self.measurements.insert(pos, measurement);
        if pos + 1 < self.measurements.len() {
            for i in self.usable.iter_mut().filter(|i| **i >= pos) {
                *i += 1;
            }
        }
        if usable {
            let slot = self
                .usable
                .partition_point(|&i| self.measurements[i].system_time <= system_time);
            self.usable.insert(slot, pos);
        }
        Ok(())
    }

    /// Rebuild the usable index from scratch
    fn reindex(&mut self) {
        let mut usable: Vec<usize> = (0..self.measurements.len())
            .filter(|&i| self.measurements[i].is_usable())
            .collect();
        usable.sort_by(|&a, &b| {
            self.measurements[a]
                .system_time
                .total_cmp(&self.measurements[b].system_time)
        });
        self.usable = usable;
    }

    /// Time span covered by usable measurements, in system time
    pub fn usable_range(&self) -> Option<(f64, f64)> {
        let first = self.usable.first()?;
        let last = self.usable.last()?;
        Some((
            self.measurements[*first].system_time,
            self.measurements[*last].system_time,
        ))
    }

    /// Offset at system time `t`
    pub fn lookup(&self, t: f64) -> OffsetLookup {
        if !t.is_finite() || self.usable.is_empty() {
            return OffsetLookup::Unavailable;
        }
        let at = |k: usize| &self.measurements[self.usable[k]];
        let uncertainty = |m: &ClockOffsetMeasurement| m.uncertainty_ms.unwrap_or(f64::INFINITY);
        let window = self.staleness_window_s;

        let idx = self.usable.partition_point(|&i| self.measurements[i].system_time <= t);
        if idx == 0 {
            let first = at(0);
            let age_s = first.system_time - t;
            return if age_s <= window {
                OffsetLookup::Held {
                    offset_ms: first.clock_offset_ms,
                    uncertainty_ms: uncertainty(first),
                    age_s,
                }
            } else {
                OffsetLookup::Unavailable
            };
        }

        let lo = at(idx - 1);
        if lo.system_time == t {
            return OffsetLookup::Interpolated {
                offset_ms: lo.clock_offset_ms,
                uncertainty_ms: uncertainty(lo),
            };
        }
        if idx == self.usable.len() {
            let age_s = t - lo.system_time;
            return if age_s <= window {
                OffsetLookup::Held {
                    offset_ms: lo.clock_offset_ms,
                    uncertainty_ms: uncertainty(lo),
                    age_s,
                }
            } else {
                OffsetLookup::Unavailable
            };
        }

        let hi = at(idx);
        let nearest = (t - lo.system_time).min(hi.system_time - t);
        if nearest > window {
            return OffsetLookup::Unavailable;
        }
        let w = (t - lo.system_time) / (hi.system_time - lo.system_time);
        OffsetLookup::Interpolated {
            offset_ms: lo.clock_offset_ms + w * (hi.clock_offset_ms - lo.clock_offset_ms),
            uncertainty_ms: uncertainty(lo) + w * (uncertainty(hi) - uncertainty(lo)),
        }
    }

    /// Grade counts over measurements at or after UTC time `since`
    pub fn grade_distribution(&self, since: Option<f64>) -> GradeDistribution {
        self.grade_distribution_in(since.unwrap_or(f64::NEG_INFINITY), f64::INFINITY)
    }

    /// Grade counts over UTC times in `[start, end)`
    pub fn grade_distribution_in(&self, start: f64, end: f64) -> GradeDistribution {
        let mut dist = GradeDistribution::default();
        for m in self
            .measurements
            .iter()
            .filter(|m| m.utc_time >= start && m.utc_time < end)
        {
            *dist.counts.entry(m.quality_grade).or_insert(0) += 1;
            dist.total += 1;
        }
        dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfts_common::model::{Confidence, PropagationMode, Station};

    fn measurement(minute: f64, offset_ms: f64, uncertainty_ms: f64) -> ClockOffsetMeasurement {
        ClockOffsetMeasurement {
            system_time: minute + offset_ms / 1000.0,
            utc_time: minute,
            clock_offset_ms: offset_ms,
            station: Some(Station::Wwv),
            propagation_mode: Some(PropagationMode::OneHopF),
            confidence: Confidence::High,
            uncertainty_ms: Some(uncertainty_ms),
            quality_grade: QualityGrade::from_uncertainty(Some(uncertainty_ms)),
            snr_db: Some(30.0),
            verified: true,
        }
    }

    fn series(entries: &[(f64, f64)]) -> ClockOffsetSeries {
        ClockOffsetSeries::from_measurements(
            "ch",
            "v1",
            120.0,
            entries.iter().map(|(t, o)| measurement(*t, *o, 0.3)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_midpoint_is_linear_interpolation() {
        let s = series(&[(600.0, 10.0), (660.0, 4.0)]);
        let t1 = 600.0 + 0.010;
        let t2 = 660.0 + 0.004;
        match s.lookup((t1 + t2) / 2.0) {
            OffsetLookup::Interpolated { offset_ms, .. } => {
                assert!((offset_ms - 7.0).abs() < 1e-9, "{offset_ms}")
            }
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_exact_hit_returns_measurement() {
        let s = series(&[(600.0, 10.0), (660.0, 4.0)]);
        assert_eq!(s.lookup(660.004).offset_ms(), Some(4.0));
    }

    #[test]
    fn test_held_within_staleness_then_unavailable() {
        let s = series(&[(600.0, 10.0), (660.0, 4.0)]);
        assert!(matches!(s.lookup(700.0), OffsetLookup::Held { .. }));
        assert!(matches!(s.lookup(500.0), OffsetLookup::Held { .. }));
        assert_eq!(s.lookup(660.004 + 120.5), OffsetLookup::Unavailable);
        assert_eq!(s.lookup(600.010 - 121.0), OffsetLookup::Unavailable);
    }

    #[test]
    fn test_wide_interior_hole_is_unavailable() {
        let s = series(&[(600.0, 10.0), (1200.0, 4.0)]);
        assert_eq!(s.lookup(900.0), OffsetLookup::Unavailable);
        assert!(s.lookup(700.0).is_available());
    }

    #[test]
    fn test_x_grade_never_participates() {
        let mut s = series(&[(600.0, 10.0), (720.0, 4.0)]);
        let mut bad = ClockOffsetMeasurement::invalid(660.0);
        bad.clock_offset_ms = 1000.0;
        s.insert(bad).unwrap();
        assert_eq!(s.len(), 3);
        let mid = s.lookup(660.007).offset_ms().unwrap();
        assert!((mid - 7.0).abs() < 0.01, "{mid}");
    }

    #[test]
    fn test_empty_series_is_unavailable() {
        let s = ClockOffsetSeries::new("ch", "v1", 120.0);
        assert_eq!(s.lookup(0.0), OffsetLookup::Unavailable);
        assert!(s.usable_range().is_none());
    }

    #[test]
    fn test_duplicate_minute_rejected() {
        let mut s = series(&[(600.0, 10.0)]);
        assert!(s.insert(measurement(600.0, 11.0, 0.3)).is_err());
    }

    #[test]
    fn test_grade_distribution() {
        let mut s = ClockOffsetSeries::new("ch", "v1", 120.0);
        s.insert(measurement(600.0, 1.0, 0.2)).unwrap();
        s.insert(measurement(660.0, 1.0, 1.0)).unwrap();
        s.insert(measurement(720.0, 1.0, 2.0)).unwrap();
        s.insert(ClockOffsetMeasurement::invalid(780.0)).unwrap();

        let all = s.grade_distribution(None);
        assert_eq!(all.total, 4);
        assert_eq!(all.count(QualityGrade::A), 1);
        assert_eq!(all.count(QualityGrade::X), 1);
        assert!((all.fraction_ab() - 0.5).abs() < 1e-12);

        let recent = s.grade_distribution(Some(700.0));
        assert_eq!(recent.total, 2);
        assert_eq!(recent.count(QualityGrade::C), 1);
    }

    #[test]
    fn test_month_of_minutes_loads_and_looks_up() {
        // One month of minutes, shuffled so the load path has to sort
        let minutes = 43_200usize;
        let mut entries: Vec<ClockOffsetMeasurement> = (0..minutes)
            .map(|k| {
                let offset = (k % 7) as f64;
                if k % 10 == 9 {
                    ClockOffsetMeasurement::invalid(k as f64 * 60.0)
                } else {
                    measurement(k as f64 * 60.0, offset, 0.3)
                }
            })
            .collect();
        entries.reverse();
        entries.swap(0, minutes / 2);

        let loaded = ClockOffsetSeries::from_measurements("ch", "v1", 120.0, entries).unwrap();
        assert_eq!(loaded.len(), minutes);
        assert!(loaded.measurements().windows(2).all(|w| w[0].utc_time < w[1].utc_time));

        let mut appended = ClockOffsetSeries::new("ch", "v1", 120.0);
        for m in loaded.measurements() {
            appended.insert(m.clone()).unwrap();
        }
        assert_eq!(appended.usable_range(), loaded.usable_range());

        let k = 30_000usize;
        let t = k as f64 * 60.0 + (k % 7) as f64 / 1000.0;
        for s in [&loaded, &appended] {
            assert_eq!(
                s.lookup(t),
                OffsetLookup::Interpolated { offset_ms: (k % 7) as f64, uncertainty_ms: 0.3 }
            );
        }
    }

    #[test]
    fn test_out_of_order_insert_keeps_index_consistent() {
        let mut s = ClockOffsetSeries::new("ch", "v1", 120.0);
        s.insert(measurement(720.0, 6.0, 0.3)).unwrap();
        s.insert(measurement(600.0, 2.0, 0.3)).unwrap();
        s.insert(ClockOffsetMeasurement::invalid(540.0)).unwrap();
        s.insert(measurement(660.0, 4.0, 0.3)).unwrap();

        let mut rebuilt = s.clone();
        rebuilt.reindex();
        assert_eq!(s.usable, rebuilt.usable);
        let t = 660.0 + 4.0 / 1000.0;
        assert_eq!(s.lookup(t), rebuilt.lookup(t));
        match s.lookup(t) {
            OffsetLookup::Interpolated { offset_ms, .. } => assert!((offset_ms - 4.0).abs() < 1e-9),
            other => panic!("expected exact hit, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_minute_rejected_on_load() {
        let entries = vec![
            measurement(660.0, 1.0, 0.3),
            measurement(600.0, 1.0, 0.3),
            measurement(660.0, 2.0, 0.3),
        ];
        assert!(ClockOffsetSeries::from_measurements("ch", "v1", 120.0, entries).is_err());
    }
}
