//! Phase-2 analysis of one archived minute
//!
//! Detector -> discriminator -> solver, yielding exactly one
//! [`ClockOffsetMeasurement`] per minute. Per-minute failures never escape as
//! errors: they come back as an X-grade measurement with the reason attached.

use crate::archive::ArchiveReader;
use crate::detect::bcd::analyze_bcd;
use crate::detect::station_id::{detect_schedule, detect_station_id, detect_test_signal};
use crate::detect::ticks::analyze_ticks;
use crate::detect::tone::{envelope, locate_marker, NarrowbandSeries};
use crate::detect::{
    confidence_for_snr, DetectionMethod, DetectionSet, MinuteWindow, StationDetections,
    StationProfile, ToneDetection,
};
use crate::discriminate::{discriminate, DiscriminationResult, Evidence};
use crate::solver::{PropagationSolution, PropagationSolver};
use hfts_common::config::{
    ChannelConfig, DetectorConfig, DiscriminatorConfig, PipelineConfig, SolverConfig,
};
use hfts_common::geo::GeoPoint;
use hfts_common::model::{
    ClockOffsetMeasurement, Confidence, DiscriminationRecord, GapRecord, QualityGrade, Station,
};
use hfts_common::time::{minute_floor, SECONDS_PER_MINUTE};
use hfts_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tick timing must agree with the marker this closely to verify it
const VERIFY_TOLERANCE_MS: f64 = 1.0;

/// Every parameter that can change a Phase-2 result
///
/// Stored with each series version so a version can always be traced back to
/// the exact settings that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub algorithm_version: String,
    pub detector: DetectorConfig,
    pub discriminator: DiscriminatorConfig,
    pub solver: SolverConfig,
}

impl AnalysisParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            algorithm_version: config.pipeline.algorithm_version.clone(),
            detector: config.detector.clone(),
            discriminator: config.discriminator.clone(),
            solver: config.solver.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of analysing one minute
#[derive(Debug, Clone)]
pub struct MinuteAnalysis {
    pub minute_start: i64,
    pub measurement: ClockOffsetMeasurement,
    pub discrimination: DiscriminationResult,
    pub detections: Option<DetectionSet>,
    pub solutions: Vec<(Station, PropagationSolution)>,
    /// Why the measurement is X-grade, if it is
    pub failure: Option<String>,
}

impl MinuteAnalysis {
    fn failed(minute_start: i64, reason: String, detections: Option<DetectionSet>) -> Self {
        Self {
            minute_start,
            measurement: ClockOffsetMeasurement::invalid(minute_start as f64),
            discrimination: DiscriminationResult::no_evidence(),
            detections,
            solutions: Vec::new(),
            failure: Some(reason),
        }
    }

    /// X-grade result for a minute whose data never arrived
    pub fn timed_out(minute_start: i64) -> Self {
        Self::failed(minute_start, "Analysis deadline passed".to_string(), None)
    }

    /// X-grade result for a minute whose segment could not be read
    pub fn unreadable(minute_start: i64, error: &Error) -> Self {
        Self::failed(minute_start, error.to_string(), None)
    }

    pub fn discrimination_record(&self, channel: &str, version: &str) -> DiscriminationRecord {
        DiscriminationRecord {
            channel: channel.to_string(),
            version: version.to_string(),
            minute_utc: self.minute_start,
            dominant_station: self.discrimination.dominant_station,
            confidence: self.discrimination.confidence,
            margin_db: self.discrimination.margin_db,
            evidence: self.discrimination.evidence_json(),
        }
    }
}

/// Assemble the analysis window for an archived minute
///
/// The pre-minute margin comes from the previous segment when it exists.
/// A neighbour that cannot be read is treated as absent and its share of the
/// margin is noted as a gap; only the minute's own segment must verify.
pub fn load_window(
    reader: &ArchiveReader,
    channel: &str,
    minute_start: i64,
    pre_margin_s: f64,
) -> Result<MinuteWindow> {
    let own = reader.read_minute(channel, minute_start)?;
    let fs = own.manifest.sample_rate as f64;
    let margin_start = minute_start as f64 - pre_margin_s.max(0.0);
    let mut gaps = own.manifest.gaps.clone();
    let mut blocks = Vec::new();

    let mut neighbour = minute_floor(margin_start);
    while neighbour < minute_start {
        if reader.has_minute(channel, neighbour) {
            match reader.read_minute(channel, neighbour) {
                Ok(segment) => blocks.extend(segment.blocks()),
                Err(e) => {
                    warn!(
                        channel,
                        minute_start,
                        neighbour,
                        "Margin segment unusable, treating as absent: {}",
                        e
                    );
                    let from = margin_start.max(neighbour as f64);
                    let until = ((neighbour + SECONDS_PER_MINUTE) as f64).min(minute_start as f64);
                    gaps.push(GapRecord {
                        system_time: from,
                        duration: until - from,
                        samples_lost: ((until - from) * fs).round() as u64,
                    });
                }
            }
        }
        neighbour += SECONDS_PER_MINUTE;
    }
    blocks.extend(own.blocks());

    Ok(MinuteWindow::assemble(
        minute_start,
        own.manifest.sample_rate,
        pre_margin_s,
        &blocks,
        gaps,
        own.manifest.archive_id.clone(),
    ))
}

/// Per-channel analysis engine
#[derive(Debug, Clone)]
pub struct Analyzer {
    channel: ChannelConfig,
    params: AnalysisParams,
    solver: PropagationSolver,
}

impl Analyzer {
    pub fn new(channel: ChannelConfig, receiver: GeoPoint, params: AnalysisParams) -> Self {
        let solver = PropagationSolver::new(receiver, channel.frequency_mhz, params.solver.clone());
        Self {
            channel,
            params,
            solver,
        }
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    /// Seconds of the previous minute each window must include
    pub fn pre_margin_s(&self) -> f64 {
        self.params.detector.pre_minute_margin_s
    }

    pub fn analyze(&self, window: &MinuteWindow) -> MinuteAnalysis {
        let minute_start = window.minute_start;
        let detector = &self.params.detector;
        if window.coverage < detector.min_coverage {
            let reason = Error::DetectionFailure(format!(
                "coverage {:.2} below {:.2}",
                window.coverage, detector.min_coverage
            ))
            .to_string();
            warn!(channel = %self.channel.name, minute_start, "{}", reason);
            return MinuteAnalysis::failed(minute_start, reason, None);
        }

        let candidates = self.channel.candidate_stations();
        let shared = candidates.len() > 1;
        let solutions: Vec<(Station, Result<PropagationSolution>)> = candidates
            .iter()
            .map(|s| (*s, self.solver.solve(*s)))
            .collect();
        let delay_of = |station: Station| {
            solutions
                .iter()
                .find(|(s, _)| *s == station)
                .and_then(|(_, r)| r.as_ref().ok())
                .map(|p| p.propagation_delay_ms)
        };

        let detections = self.detect(window, &candidates, &delay_of);
        let discrimination = if shared {
            discriminate(&self.evidence(&detections), &self.params.discriminator)
        } else {
            let station = candidates.first().copied().unwrap_or(Station::Wwv);
            let confidence = detections
                .station(station)
                .and_then(|d| d.marker.as_ref())
                .map(|m| m.confidence)
                .unwrap_or(Confidence::Low);
            DiscriminationResult::single_station(station, confidence)
        };

        let chosen = match choose_detection(&detections, &discrimination) {
            Some(d) => d,
            None => {
                let reason =
                    Error::DetectionFailure("no station tone above threshold".to_string())
                        .to_string();
                warn!(channel = %self.channel.name, minute_start, "{}", reason);
                let mut result = MinuteAnalysis::failed(minute_start, reason, Some(detections));
                result.discrimination = discrimination;
                return result;
            }
        };

        let solution = match solutions.iter().find(|(s, _)| *s == chosen.station) {
            Some((_, Ok(solution))) => *solution,
            Some((_, Err(e))) => {
                warn!(channel = %self.channel.name, minute_start, "{}", e);
                let mut result =
                    MinuteAnalysis::failed(minute_start, e.to_string(), Some(detections));
                result.discrimination = discrimination;
                return result;
            }
            None => {
                let mut result = MinuteAnalysis::failed(
                    minute_start,
                    format!("{} is not a candidate on this channel", chosen.station),
                    Some(detections),
                );
                result.discrimination = discrimination;
                return result;
            }
        };

        let clock_offset_ms = chosen.timing_error_ms - solution.propagation_delay_ms;
        let ambiguous = shared && discrimination.is_ambiguous();
        let uncertainty_ms =
            self.solver
                .uncertainty_ms(solution.path_mode, chosen.snr_db, ambiguous);
        let confidence = if shared {
            chosen.confidence.min(discrimination.confidence)
        } else {
            chosen.confidence
        };
        let verified = verify(&detections, &chosen, shared, &discrimination);

        let measurement = ClockOffsetMeasurement {
            system_time: minute_start as f64 + clock_offset_ms / 1000.0,
            utc_time: minute_start as f64,
            clock_offset_ms,
            station: Some(chosen.station),
            propagation_mode: Some(solution.path_mode),
            confidence,
            uncertainty_ms: Some(uncertainty_ms),
            quality_grade: QualityGrade::from_uncertainty(Some(uncertainty_ms)),
            snr_db: Some(chosen.snr_db),
            verified,
        };
        debug!(
            channel = %self.channel.name,
            minute_start,
            station = %chosen.station,
            mode = %solution.path_mode,
            offset_ms = clock_offset_ms,
            grade = %measurement.quality_grade,
            "Minute analysed"
        );

        MinuteAnalysis {
            minute_start,
            measurement,
            discrimination,
            detections: Some(detections),
            solutions: solutions
                .into_iter()
                .filter_map(|(s, r)| r.ok().map(|p| (s, p)))
                .collect(),
            failure: None,
        }
    }

    /// Run every detector that applies to this channel
    fn detect(
        &self,
        window: &MinuteWindow,
        candidates: &[Station],
        delay_of: &dyn Fn(Station) -> Option<f64>,
    ) -> DetectionSet {
        let config = &self.params.detector;
        let env = envelope(window);

        let mut markers = Vec::new();
        for &station in candidates {
            let profile = StationProfile::for_station(station);
            let series = NarrowbandSeries::new(&env, window.sample_rate, profile.tone_hz);
            let search = locate_marker(window, &env, &series, &profile, config);
            markers.push((station, profile, series, search));
        }

        // Clock estimate from the strongest marker; anchors searches for the
        // weaker station
        let clock_estimate_ms = markers
            .iter()
            .filter(|(_, _, _, m)| m.detected)
            .max_by(|a, b| {
                a.3.snr_db
                    .unwrap_or(f64::MIN)
                    .total_cmp(&b.3.snr_db.unwrap_or(f64::MIN))
            })
            .and_then(|(station, _, _, m)| delay_of(*station).map(|d| m.timing_error_ms - d));

        let mut stations = Vec::new();
        for (station, profile, series, search) in markers {
            let marker = if search.detected {
                search.snr_db.map(|snr_db| ToneDetection {
                    station,
                    timing_error_ms: search.timing_error_ms,
                    snr_db,
                    confidence: confidence_for_snr(snr_db),
                    method: DetectionMethod::MinuteMarker,
                })
            } else {
                None
            };
            let reference_ms = match &marker {
                Some(m) => Some(m.timing_error_ms),
                None => clock_estimate_ms.and_then(|c| delay_of(station).map(|d| c + d)),
            };
            let ticks = match reference_ms {
                Some(reference) => analyze_ticks(window, &env, &series, &profile, config, reference),
                None => Default::default(),
            };
            stations.push(StationDetections {
                station,
                marker_search: search,
                marker,
                ticks,
            });
        }

        let shared = candidates.len() > 1;
        let bcd = if shared {
            clock_estimate_ms.and_then(|c| {
                let expected: Vec<(Station, f64)> = candidates
                    .iter()
                    .filter_map(|s| delay_of(*s).map(|d| (*s, c + d)))
                    .collect();
                analyze_bcd(window, &env, config, &expected)
            })
        } else {
            None
        };

        DetectionSet {
            minute_start: window.minute_start,
            coverage: window.coverage,
            stations,
            bcd,
            station_id: detect_station_id(window, &env, config, candidates),
            test_signal: detect_test_signal(window, &env, config, candidates),
            schedule: if shared {
                detect_schedule(window, &env, config)
            } else {
                None
            },
        }
    }

    /// Discriminator inputs from a shared channel's detections
    fn evidence(&self, detections: &DetectionSet) -> Vec<Evidence> {
        let threshold = self.params.detector.detection_snr_db;
        let above = |snr: Option<f64>| snr.filter(|s| *s >= threshold);
        let marker_snr = |station| detections.station(station).and_then(|d| d.marker_snr_db());

        let mut evidence = vec![Evidence::ToneSnr {
            wwv_db: marker_snr(Station::Wwv),
            wwvh_db: marker_snr(Station::Wwvh),
        }];
        if let Some(bcd) = &detections.bcd {
            evidence.push(Evidence::BcdAmplitude {
                wwv_amplitude: bcd.wwv_amplitude,
                wwvh_amplitude: bcd.wwvh_amplitude,
                noise: bcd.noise,
                ratio_db: bcd.ratio_db,
                valid_windows: bcd.valid_windows,
            });
        }
        if let Some(id) = detections.station_id.as_ref().filter(|d| d.detected) {
            evidence.push(Evidence::StationIdTone {
                station: id.station,
                snr_db: id.snr_db.unwrap_or(threshold),
            });
        }
        if let Some(test) = detections.test_signal.as_ref().filter(|d| d.detected) {
            evidence.push(Evidence::TestSignal {
                station: test.station,
                tones_detected: test.tones_detected,
                tones_evaluated: test.tones_evaluated,
            });
        }
        if let Some(schedule) = &detections.schedule {
            evidence.push(Evidence::ToneSchedule {
                wwv_db: above(schedule.wwv_snr_db),
                wwvh_db: above(schedule.wwvh_snr_db),
            });
        }
        evidence
    }
}

/// Best timing detection for a station: marker first, then ticks
fn station_detection(detections: &StationDetections) -> Option<ToneDetection> {
    detections
        .marker
        .clone()
        .or_else(|| detections.tick_detection())
}

/// Detection of the dominant station, else the strongest detection overall
fn choose_detection(
    detections: &DetectionSet,
    discrimination: &DiscriminationResult,
) -> Option<ToneDetection> {
    let dominant = discrimination
        .dominant_station
        .station()
        .and_then(|s| detections.station(s))
        .and_then(station_detection);
    if dominant.is_some() {
        return dominant;
    }
    detections
        .stations
        .iter()
        .filter_map(station_detection)
        .max_by(|a, b| a.snr_db.total_cmp(&b.snr_db))
}

fn verify(
    detections: &DetectionSet,
    chosen: &ToneDetection,
    shared: bool,
    discrimination: &DiscriminationResult,
) -> bool {
    if chosen.method != DetectionMethod::MinuteMarker {
        return false;
    }
    if shared && discrimination.confidence != Confidence::High {
        return false;
    }
    detections
        .station(chosen.station)
        .and_then(|d| d.ticks.timing_error_ms)
        .map(|tick_ms| (tick_ms - chosen.timing_error_ms).abs() <= VERIFY_TOLERANCE_MS)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticMinute, SyntheticStation};
    use hfts_common::geo::grid_square_to_point;
    use hfts_common::model::{DominantStation, PropagationMode};

    fn analyzer(frequency_mhz: f64) -> Analyzer {
        let channel = ChannelConfig {
            name: "test".to_string(),
            frequency_mhz,
            sample_rate: 4000,
        };
        let params = AnalysisParams::from_config(&PipelineConfig::default());
        Analyzer::new(channel, grid_square_to_point("EM12").unwrap(), params)
    }

    fn window(analyzer: &Analyzer, minute: &SyntheticMinute) -> MinuteWindow {
        let block = minute.block();
        MinuteWindow::assemble(
            minute.minute_start,
            minute.sample_rate,
            analyzer.pre_margin_s(),
            &[block],
            Vec::new(),
            format!("test@{}", minute.minute_start),
        )
    }

    // Minute 5 of the hour: no ID or test signal
    const MINUTE: i64 = 1_709_294_700;

    #[test]
    fn test_single_wwv_recovers_offset() {
        let a = analyzer(20.0);
        let delay = a.solver.solve(Station::Wwv).unwrap().propagation_delay_ms;
        let minute = SyntheticMinute::new(MINUTE, 4000, 12.5)
            .with_station(SyntheticStation::new(Station::Wwv, delay, 0.3));
        let result = a.analyze(&window(&a, &minute));

        assert!(result.failure.is_none(), "{:?}", result.failure);
        let m = &result.measurement;
        assert_eq!(m.station, Some(Station::Wwv));
        assert_eq!(m.propagation_mode, Some(PropagationMode::OneHopF));
        assert!((m.clock_offset_ms - 12.5).abs() < 1.0, "{}", m.clock_offset_ms);
        assert!(m.quality_grade <= QualityGrade::B);
        assert!(m.verified);
        assert_eq!(m.utc_time, MINUTE as f64);
    }

    #[test]
    fn test_shared_channel_picks_dominant_station() {
        let a = analyzer(10.0);
        let wwv = a.solver.solve(Station::Wwv).unwrap().propagation_delay_ms;
        let wwvh = a.solver.solve(Station::Wwvh).unwrap().propagation_delay_ms;
        let minute = SyntheticMinute::new(MINUTE, 4000, -20.0)
            .with_station(SyntheticStation::new(Station::Wwv, wwv, 0.05))
            .with_station(SyntheticStation::new(Station::Wwvh, wwvh, 0.4));
        let result = a.analyze(&window(&a, &minute));

        assert_eq!(result.discrimination.dominant_station, DominantStation::Wwvh);
        assert_eq!(result.measurement.station, Some(Station::Wwvh));
        assert!((result.measurement.clock_offset_ms + 20.0).abs() < 1.0);
        let record = result.discrimination_record("test", "v1");
        assert_eq!(record.minute_utc, MINUTE);
        assert!(record.evidence["evidence"].is_array());
    }

    #[test]
    fn test_silent_minute_is_x_grade() {
        let a = analyzer(10.0);
        let minute = SyntheticMinute::new(MINUTE, 4000, 0.0);
        let result = a.analyze(&window(&a, &minute));
        assert_eq!(result.measurement.quality_grade, QualityGrade::X);
        assert!(result.failure.is_some());
        assert!(!result.measurement.is_usable());
    }

    #[test]
    fn test_low_coverage_is_x_grade() {
        let a = analyzer(10.0);
        let empty = MinuteWindow::assemble(MINUTE, 4000, 0.5, &[], Vec::new(), "x".into());
        let result = a.analyze(&empty);
        assert_eq!(result.measurement.quality_grade, QualityGrade::X);
        assert!(result.detections.is_none());
    }

    #[test]
    fn test_params_serialise_every_threshold() {
        let params = AnalysisParams::from_config(&PipelineConfig::default());
        let json: serde_json::Value = serde_json::from_str(&params.to_json().unwrap()).unwrap();
        assert_eq!(json["algorithm_version"], "v1");
        assert_eq!(json["discriminator"]["dominance_threshold_db"], 3.0);
        assert_eq!(json["detector"]["coherence_margin_db"], 3.0);
    }

    #[test]
    fn test_load_window_uses_previous_minute_for_margin() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::archive::ArchiveWriter::open(dir.path(), "test", 1000).unwrap();
        let minute = SyntheticMinute::new(MINUTE, 1000, 0.0);
        writer
            .push_block(&minute.block_range((MINUTE - 60) as f64, (MINUTE + 60) as f64))
            .unwrap();
        writer.flush().unwrap();

        let reader = ArchiveReader::new(dir.path());
        let window = load_window(&reader, "test", MINUTE, 0.5).unwrap();
        assert_eq!(window.len(), 60_500);
        assert!(window.present.iter().all(|p| *p));
        assert!((window.coverage - 1.0).abs() < 1e-12);
        assert_eq!(window.source_archive_id, crate::archive::archive_id("test", MINUTE));

        // First minute has no predecessor: margin stays empty
        let first = load_window(&reader, "test", MINUTE - 60, 0.5).unwrap();
        assert!(!first.present[0]);
        assert!((first.coverage - 1.0).abs() < 1e-12);

        assert!(matches!(
            load_window(&reader, "test", MINUTE + 60, 0.5),
            Err(Error::DataUnavailable(_))
        ));
    }

    #[test]
    fn test_corrupt_previous_minute_only_costs_the_margin() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = crate::archive::ArchiveWriter::open(dir.path(), "test", 1000).unwrap();
        let minute = SyntheticMinute::new(MINUTE, 1000, 0.0);
        writer
            .push_block(&minute.block_range((MINUTE - 60) as f64, (MINUTE + 60) as f64))
            .unwrap();
        writer.flush().unwrap();

        let reader = ArchiveReader::new(dir.path());
        let path = reader.layout().payload_path("test", MINUTE - 60);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[64] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let window = load_window(&reader, "test", MINUTE, 0.5).unwrap();
        assert!(!window.present[0]);
        assert!((window.coverage - 1.0).abs() < 1e-12);
        assert_eq!(window.gaps.len(), 1);
        assert_eq!(window.gaps[0].samples_lost, 500);
        assert!((window.gaps[0].system_time - (MINUTE as f64 - 0.5)).abs() < 1e-9);

        // The corrupt minute itself still refuses to load
        assert!(matches!(
            load_window(&reader, "test", MINUTE - 60, 0.5),
            Err(Error::ArchiveCorruption(_))
        ));
    }
}
