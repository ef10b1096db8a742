//! Tone & marker detection
//!
//! Works on one minute of archived samples at a time. Everything is derived
//! from the AM envelope of the complex baseband: the station tones, ticks,
//! the 100 Hz BCD subcarrier and the ID/test/schedule tones are all audio
//! modulation on the carrier.
//!
//! Below-threshold results are reported as "not detected", never as a
//! low-confidence detection.

pub mod bcd;
pub mod profile;
pub mod station_id;
pub mod ticks;
pub mod tone;

use hfts_common::model::{Confidence, GapRecord, SampleBlock, Station};
use hfts_common::time::SECONDS_PER_MINUTE;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

pub use bcd::BcdAnalysis;
pub use profile::StationProfile;
pub use station_id::{ScheduleDetection, StationIdDetection, TestSignalDetection};
pub use ticks::{TickAnalysis, TickWindow};
pub use tone::MarkerSearch;

/// How a timing estimate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    MinuteMarker,
    TickCoherent,
    TickIncoherent,
}

/// One positive detection of a station's timing signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneDetection {
    pub station: Station,
    /// Arrival time relative to the nominal system-time minute boundary
    pub timing_error_ms: f64,
    pub snr_db: f64,
    pub confidence: Confidence,
    pub method: DetectionMethod,
}

/// Confidence tier for a detection that passed the threshold
pub fn confidence_for_snr(snr_db: f64) -> Confidence {
    if snr_db >= 20.0 {
        Confidence::High
    } else if snr_db >= 10.0 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// One minute of samples laid out on a regular grid
///
/// The grid starts `pre_margin_s` before the minute so markers arriving
/// early (negative clock offset) are still inside the search range. Missing
/// samples stay zero and are flagged in `present`.
#[derive(Debug, Clone)]
pub struct MinuteWindow {
    pub minute_start: i64,
    pub sample_rate: u32,
    /// System time of `samples[0]`
    pub start_time: f64,
    pub pre_margin_s: f64,
    pub samples: Vec<Complex32>,
    pub present: Vec<bool>,
    pub gaps: Vec<GapRecord>,
    /// Fraction of the minute proper covered by samples
    pub coverage: f64,
    pub source_archive_id: String,
}

impl MinuteWindow {
    /// Place `blocks` on the grid for `minute_start`
    ///
    /// Blocks may come from the previous minute's segment; anything outside
    /// the window is ignored.
    pub fn assemble(
        minute_start: i64,
        sample_rate: u32,
        pre_margin_s: f64,
        blocks: &[SampleBlock],
        gaps: Vec<GapRecord>,
        source_archive_id: String,
    ) -> Self {
        let fs = sample_rate as f64;
        let pre = (pre_margin_s.max(0.0) * fs).round() as usize;
        let minute_len = (SECONDS_PER_MINUTE as f64 * fs) as usize;
        let len = pre + minute_len;
        let start_time = minute_start as f64 - pre as f64 / fs;

        let mut samples = vec![Complex32::new(0.0, 0.0); len];
        let mut present = vec![false; len];

        for block in blocks.iter().filter(|b| b.sample_rate == sample_rate) {
            let first = ((block.system_time_start - start_time) * fs).round() as i64;
            for (i, sample) in block.samples.iter().enumerate() {
                let idx = first + i as i64;
                if idx < 0 {
                    continue;
                }
                let idx = idx as usize;
                if idx >= len {
                    break;
                }
                samples[idx] = *sample;
                present[idx] = true;
            }
        }

        let covered = present[pre..].iter().filter(|p| **p).count();
        Self {
            minute_start,
            sample_rate,
            start_time,
            pre_margin_s: pre as f64 / fs,
            samples,
            present,
            gaps,
            coverage: covered as f64 / minute_len as f64,
            source_archive_id,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Grid index of a time given in seconds after the minute boundary
    pub fn index_of(&self, seconds_after_minute: f64) -> i64 {
        ((seconds_after_minute + self.pre_margin_s) * self.sample_rate as f64).round() as i64
    }

    /// Seconds after the minute boundary for a (fractional) grid index
    pub fn seconds_at(&self, index: f64) -> f64 {
        index / self.sample_rate as f64 - self.pre_margin_s
    }
}

/// Everything the detectors found for one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationDetections {
    pub station: Station,
    pub marker_search: MarkerSearch,
    pub marker: Option<ToneDetection>,
    pub ticks: TickAnalysis,
}

impl StationDetections {
    /// Marker SNR if the marker was detected
    pub fn marker_snr_db(&self) -> Option<f64> {
        self.marker.as_ref().map(|d| d.snr_db)
    }

    pub fn tick_detection(&self) -> Option<ToneDetection> {
        self.ticks.detection(self.station)
    }
}

/// Per-minute detector output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    pub minute_start: i64,
    pub coverage: f64,
    pub stations: Vec<StationDetections>,
    pub bcd: Option<BcdAnalysis>,
    pub station_id: Option<StationIdDetection>,
    pub test_signal: Option<TestSignalDetection>,
    pub schedule: Option<ScheduleDetection>,
}

impl DetectionSet {
    pub fn station(&self, station: Station) -> Option<&StationDetections> {
        self.stations.iter().find(|s| s.station == station)
    }

    /// All positive timing detections
    pub fn detections(&self) -> Vec<ToneDetection> {
        let mut out = Vec::new();
        for s in &self.stations {
            if let Some(marker) = &s.marker {
                out.push(marker.clone());
            }
            if let Some(tick) = s.tick_detection() {
                out.push(tick);
            }
        }
        out
    }

    /// Station whose minute marker came in strongest
    pub fn strongest_marker(&self) -> Option<&ToneDetection> {
        self.stations
            .iter()
            .filter_map(|s| s.marker.as_ref())
            .max_by(|a, b| a.snr_db.total_cmp(&b.snr_db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_places_blocks_by_time() {
        let fs = 100;
        let block = SampleBlock::new(
            600.0 - 0.2,
            fs,
            vec![Complex32::new(1.0, 0.0); 100],
        );
        let window = MinuteWindow::assemble(600, fs, 0.5, &[block], Vec::new(), "c@600".into());

        assert_eq!(window.len(), 50 + 6000);
        // 0.2 s before the minute is index 30
        assert!(!window.present[29]);
        assert!(window.present[30]);
        assert!(window.present[129]);
        assert!(!window.present[130]);
        // 80 of the 100 samples fall inside the minute proper
        assert!((window.coverage - 80.0 / 6000.0).abs() < 1e-12);
        assert_eq!(window.index_of(0.0), 50);
        assert!((window.seconds_at(150.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(confidence_for_snr(25.0), Confidence::High);
        assert_eq!(confidence_for_snr(12.0), Confidence::Medium);
        assert_eq!(confidence_for_snr(6.5), Confidence::Low);
    }
}
