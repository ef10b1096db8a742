//! Data model shared by the archive, analysis and product stages
//!
//! Everything here is plain data: serde-serialisable, cheap to clone, and free
//! of behaviour beyond small derived quantities. Sample payloads are held in
//! `Arc<[Complex32]>` so a block can be handed to several readers without
//! copying and without any of them being able to mutate it.

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Time-standard transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Station {
    #[serde(rename = "WWV")]
    Wwv,
    #[serde(rename = "WWVH")]
    Wwvh,
    #[serde(rename = "CHU")]
    Chu,
}

impl Station {
    pub fn as_str(&self) -> &'static str {
        match self {
            Station::Wwv => "WWV",
            Station::Wwvh => "WWVH",
            Station::Chu => "CHU",
        }
    }

    pub fn parse(s: &str) -> Option<Station> {
        match s {
            "WWV" => Some(Station::Wwv),
            "WWVH" => Some(Station::Wwvh),
            "CHU" => Some(Station::Chu),
            _ => None,
        }
    }

    /// The co-channel counterpart for WWV/WWVH discrimination
    pub fn counterpart(&self) -> Option<Station> {
        match self {
            Station::Wwv => Some(Station::Wwvh),
            Station::Wwvh => Some(Station::Wwv),
            Station::Chu => None,
        }
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of the station discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DominantStation {
    #[serde(rename = "WWV")]
    Wwv,
    #[serde(rename = "WWVH")]
    Wwvh,
    #[serde(rename = "BALANCED")]
    Balanced,
    /// No usable evidence at all
    #[serde(rename = "NONE")]
    NoEvidence,
}

impl DominantStation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DominantStation::Wwv => "WWV",
            DominantStation::Wwvh => "WWVH",
            DominantStation::Balanced => "BALANCED",
            DominantStation::NoEvidence => "NONE",
        }
    }

    pub fn station(&self) -> Option<Station> {
        match self {
            DominantStation::Wwv => Some(Station::Wwv),
            DominantStation::Wwvh => Some(Station::Wwvh),
            DominantStation::Balanced | DominantStation::NoEvidence => None,
        }
    }

    /// Mirror image used when WWV and WWVH evidence is swapped
    pub fn mirrored(&self) -> DominantStation {
        match self {
            DominantStation::Wwv => DominantStation::Wwvh,
            DominantStation::Wwvh => DominantStation::Wwv,
            other => *other,
        }
    }
}

/// Confidence tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Confidence> {
        match s {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

/// Ionospheric propagation path classification
///
/// Closed set; every consumer matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationMode {
    GroundWave,
    #[serde(rename = "1E")]
    OneHopE,
    #[serde(rename = "1F")]
    OneHopF,
    #[serde(rename = "2F")]
    TwoHopF,
    #[serde(rename = "3F")]
    ThreeHopF,
}

impl PropagationMode {
    pub const ALL: [PropagationMode; 5] = [
        PropagationMode::GroundWave,
        PropagationMode::OneHopE,
        PropagationMode::OneHopF,
        PropagationMode::TwoHopF,
        PropagationMode::ThreeHopF,
    ];

    /// Number of ionospheric reflections (0 for ground wave)
    pub fn hops(&self) -> u32 {
        match self {
            PropagationMode::GroundWave => 0,
            PropagationMode::OneHopE | PropagationMode::OneHopF => 1,
            PropagationMode::TwoHopF => 2,
            PropagationMode::ThreeHopF => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationMode::GroundWave => "GroundWave",
            PropagationMode::OneHopE => "1E",
            PropagationMode::OneHopF => "1F",
            PropagationMode::TwoHopF => "2F",
            PropagationMode::ThreeHopF => "3F",
        }
    }

    pub fn parse(s: &str) -> Option<PropagationMode> {
        Self::ALL.iter().copied().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for PropagationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal trust label for one offset measurement
///
/// Ordering follows trustworthiness: `A < B < C < D < X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityGrade {
    A,
    B,
    C,
    D,
    X,
}

impl QualityGrade {
    pub const ALL: [QualityGrade; 5] = [
        QualityGrade::A,
        QualityGrade::B,
        QualityGrade::C,
        QualityGrade::D,
        QualityGrade::X,
    ];

    /// Grade from total uncertainty; `None` or non-finite means invalid
    ///
    /// A < 0.5 ms, B 0.5-1.5 ms, C 1.5-3.0 ms, D > 3.0 ms.
    pub fn from_uncertainty(uncertainty_ms: Option<f64>) -> QualityGrade {
        match uncertainty_ms {
            Some(u) if u.is_finite() && u >= 0.0 => {
                if u < 0.5 {
                    QualityGrade::A
                } else if u <= 1.5 {
                    QualityGrade::B
                } else if u <= 3.0 {
                    QualityGrade::C
                } else {
                    QualityGrade::D
                }
            }
            _ => QualityGrade::X,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != QualityGrade::X
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityGrade::A => "A",
            QualityGrade::B => "B",
            QualityGrade::C => "C",
            QualityGrade::D => "D",
            QualityGrade::X => "X",
        }
    }

    pub fn parse(s: &str) -> Option<QualityGrade> {
        Self::ALL.iter().copied().find(|g| g.as_str() == s)
    }
}

impl fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contiguous complex baseband samples
///
/// `system_time_start` is seconds since the Unix epoch on the receiver's
/// (uncorrected) system clock.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub system_time_start: f64,
    pub sample_rate: u32,
    pub samples: Arc<[Complex32]>,
}

impl SampleBlock {
    pub fn new(system_time_start: f64, sample_rate: u32, samples: Vec<Complex32>) -> Self {
        Self {
            system_time_start,
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// System time one sample period past the last sample
    pub fn end_time(&self) -> f64 {
        self.system_time_start + self.duration()
    }

    pub fn time_of(&self, index: usize) -> f64 {
        self.system_time_start + index as f64 / self.sample_rate as f64
    }

    /// Sub-block covering `[start, end)` sample indices (clamped)
    pub fn slice(&self, start: usize, end: usize) -> SampleBlock {
        let end = end.min(self.samples.len());
        let start = start.min(end);
        SampleBlock {
            system_time_start: self.time_of(start),
            sample_rate: self.sample_rate,
            samples: self.samples[start..end].into(),
        }
    }
}

/// Missing-sample notice attached to the archive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub system_time: f64,
    /// Seconds
    pub duration: f64,
    pub samples_lost: u64,
}

/// One per-minute clock offset measurement (D_clock)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockOffsetMeasurement {
    /// System time at which UTC read `utc_time`
    pub system_time: f64,
    /// Nominal UTC minute boundary the measurement refers to
    pub utc_time: f64,
    /// system - UTC, milliseconds
    pub clock_offset_ms: f64,
    pub station: Option<Station>,
    pub propagation_mode: Option<PropagationMode>,
    pub confidence: Confidence,
    pub uncertainty_ms: Option<f64>,
    pub quality_grade: QualityGrade,
    pub snr_db: Option<f64>,
    pub verified: bool,
}

impl ClockOffsetMeasurement {
    /// X-grade placeholder for a minute that produced no usable result
    pub fn invalid(utc_time: f64) -> Self {
        Self {
            system_time: utc_time,
            utc_time,
            clock_offset_ms: 0.0,
            station: None,
            propagation_mode: None,
            confidence: Confidence::Low,
            uncertainty_ms: None,
            quality_grade: QualityGrade::X,
            snr_db: None,
            verified: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.quality_grade.is_valid() && self.clock_offset_ms.is_finite()
    }
}

/// Persisted discriminator output with its raw evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminationRecord {
    pub channel: String,
    pub version: String,
    pub minute_utc: i64,
    pub dominant_station: DominantStation,
    pub confidence: Confidence,
    pub margin_db: f64,
    pub evidence: serde_json::Value,
}

/// Processing stage tag carried by derived artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    RawArchive,
    Analysis,
    CorrectedProduct,
}

/// Where a derived artifact came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_archive_id: String,
    pub offset_series_version: String,
    pub processing_phase: ProcessingPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(QualityGrade::from_uncertainty(Some(0.0)), QualityGrade::A);
        assert_eq!(QualityGrade::from_uncertainty(Some(0.49)), QualityGrade::A);
        assert_eq!(QualityGrade::from_uncertainty(Some(0.5)), QualityGrade::B);
        assert_eq!(QualityGrade::from_uncertainty(Some(1.5)), QualityGrade::B);
        assert_eq!(QualityGrade::from_uncertainty(Some(1.51)), QualityGrade::C);
        assert_eq!(QualityGrade::from_uncertainty(Some(3.0)), QualityGrade::C);
        assert_eq!(QualityGrade::from_uncertainty(Some(3.01)), QualityGrade::D);
        assert_eq!(QualityGrade::from_uncertainty(None), QualityGrade::X);
        assert_eq!(QualityGrade::from_uncertainty(Some(f64::NAN)), QualityGrade::X);
        assert_eq!(QualityGrade::from_uncertainty(Some(-1.0)), QualityGrade::X);
    }

    #[test]
    fn test_grade_monotone_in_uncertainty() {
        let mut previous = QualityGrade::A;
        let mut u = 0.0;
        while u < 10.0 {
            let grade = QualityGrade::from_uncertainty(Some(u));
            assert!(grade >= previous, "grade regressed at {u} ms");
            previous = grade;
            u += 0.01;
        }
        assert!(QualityGrade::from_uncertainty(None) > previous);
    }

    #[test]
    fn test_mode_names_round_trip_through_parse() {
        for mode in PropagationMode::ALL {
            assert_eq!(PropagationMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(
            serde_json::to_string(&PropagationMode::TwoHopF).unwrap(),
            "\"2F\""
        );
    }

    #[test]
    fn test_dominant_station_serialises_upper_case() {
        assert_eq!(
            serde_json::to_string(&DominantStation::NoEvidence).unwrap(),
            "\"NONE\""
        );
        assert_eq!(DominantStation::Wwv.mirrored(), DominantStation::Wwvh);
        assert_eq!(DominantStation::Balanced.mirrored(), DominantStation::Balanced);
    }

    #[test]
    fn test_sample_block_slice_keeps_timing() {
        let block = SampleBlock::new(100.0, 10, vec![Complex32::new(1.0, 0.0); 20]);
        let tail = block.slice(5, 100);
        assert_eq!(tail.sample_count(), 15);
        assert!((tail.system_time_start - 100.5).abs() < 1e-12);
        assert!((block.end_time() - 102.0).abs() < 1e-12);
    }
}
