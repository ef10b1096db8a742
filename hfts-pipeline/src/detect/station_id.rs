//! Station-identifying tones
//!
//! - 440 Hz: WWVH in minute 1, WWV in minute 2, seconds 1-45
//! - Multitone test signal: WWV minute 8, WWVH minute 44, seconds 13-23
//! - 500/600 Hz schedule: WWV and WWVH use opposite tones each minute

use super::profile::{schedule_excluded, StationProfile};
use super::tone::{band_power_snr_db, snr_db};
use super::MinuteWindow;
use hfts_common::config::DetectorConfig;
use hfts_common::model::Station;
use hfts_common::time::minute_of_hour;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

pub const STATION_ID_HZ: f64 = 440.0;
const STATION_ID_SECONDS: (u32, u32) = (1, 45);
const TEST_SIGNAL_SECONDS: (u32, u32) = (13, 23);
const SCHEDULE_SECONDS: (u32, u32) = (1, 45);

/// Noise reference bins either side of a test tone
const TEST_NOISE_BINS: (usize, usize) = (20, 50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationIdDetection {
    pub station: Station,
    pub snr_db: Option<f64>,
    pub detected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSignalDetection {
    pub station: Station,
    pub tones_evaluated: usize,
    pub tones_detected: usize,
    pub detected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDetection {
    pub wwv_tone_hz: f64,
    pub wwvh_tone_hz: f64,
    pub wwv_snr_db: Option<f64>,
    pub wwvh_snr_db: Option<f64>,
}

/// Station expected to carry a given per-minute feature
fn scheduled_station(
    minute: u32,
    candidates: &[Station],
    select: impl Fn(&StationProfile) -> Option<u32>,
) -> Option<Station> {
    candidates
        .iter()
        .copied()
        .find(|s| select(&StationProfile::for_station(*s)) == Some(minute))
}

/// 440 Hz identification tone, only in the minute one candidate sends it
pub fn detect_station_id(
    window: &MinuteWindow,
    env: &[f32],
    config: &DetectorConfig,
    candidates: &[Station],
) -> Option<StationIdDetection> {
    let minute = minute_of_hour(window.minute_start);
    let station = scheduled_station(minute, candidates, |p| p.station_id_minute)?;
    let snr = band_power_snr_db(
        window,
        env,
        STATION_ID_HZ,
        STATION_ID_SECONDS.0,
        STATION_ID_SECONDS.1,
        &config.guard_offsets_hz,
    );
    Some(StationIdDetection {
        station,
        snr_db: snr,
        detected: snr.map(|s| s >= config.detection_snr_db).unwrap_or(false),
    })
}

/// Multitone test signal in its scheduled minute
///
/// Averages 1 s power spectra (1 Hz bins) and compares each tone bin with
/// the mean of nearby bins. Tones at or above Nyquist cannot be evaluated.
pub fn detect_test_signal(
    window: &MinuteWindow,
    env: &[f32],
    config: &DetectorConfig,
    candidates: &[Station],
) -> Option<TestSignalDetection> {
    let minute = minute_of_hour(window.minute_start);
    let station = scheduled_station(minute, candidates, |p| p.test_signal_minute)?;

    let fs = window.sample_rate as usize;
    let nyquist = window.sample_rate as f64 / 2.0;
    let tones: Vec<f64> = config
        .test_signal_tones_hz
        .iter()
        .copied()
        .filter(|f| *f > TEST_NOISE_BINS.1 as f64 && *f + (TEST_NOISE_BINS.1 as f64) < nyquist)
        .collect();
    if tones.is_empty() {
        return Some(TestSignalDetection {
            station,
            tones_evaluated: 0,
            tones_detected: 0,
            detected: false,
        });
    }

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fs);
    let mut spectrum = vec![0.0f64; fs];
    let mut frames = 0usize;
    for second in TEST_SIGNAL_SECONDS.0..TEST_SIGNAL_SECONDS.1 {
        let start = window.index_of(second as f64);
        if start < 0 || start as usize + fs > env.len() {
            continue;
        }
        let start = start as usize;
        let mut buffer: Vec<Complex<f64>> = env[start..start + fs]
            .iter()
            .map(|v| Complex::new(*v as f64, 0.0))
            .collect();
        fft.process(&mut buffer);
        for (acc, bin) in spectrum.iter_mut().zip(&buffer) {
            *acc += bin.norm_sqr();
        }
        frames += 1;
    }
    if frames == 0 {
        return None;
    }

    let mut detected_count = 0;
    for tone in &tones {
        let bin = tone.round() as usize;
        let (near, far) = TEST_NOISE_BINS;
        let noise_bins: Vec<f64> = (near..=far)
            .flat_map(|o| [bin - o, bin + o])
            .map(|b| spectrum[b])
            .collect();
        let noise = noise_bins.iter().sum::<f64>() / noise_bins.len() as f64;
        if snr_db(spectrum[bin], noise)
            .map(|s| s >= config.detection_snr_db)
            .unwrap_or(false)
        {
            detected_count += 1;
        }
    }

    Some(TestSignalDetection {
        station,
        tones_evaluated: tones.len(),
        tones_detected: detected_count,
        detected: detected_count * 2 >= tones.len(),
    })
}

/// 500/600 Hz schedule tones, outside the excluded minutes
pub fn detect_schedule(
    window: &MinuteWindow,
    env: &[f32],
    config: &DetectorConfig,
) -> Option<ScheduleDetection> {
    let minute = minute_of_hour(window.minute_start);
    if schedule_excluded(minute) {
        return None;
    }
    let wwv_tone_hz = StationProfile::for_station(Station::Wwv).schedule_tone_hz(minute)?;
    let wwvh_tone_hz = StationProfile::for_station(Station::Wwvh).schedule_tone_hz(minute)?;
    let measure = |f: f64| {
        band_power_snr_db(
            window,
            env,
            f,
            SCHEDULE_SECONDS.0,
            SCHEDULE_SECONDS.1,
            &config.guard_offsets_hz,
        )
    };
    Some(ScheduleDetection {
        wwv_tone_hz,
        wwvh_tone_hz,
        wwv_snr_db: measure(wwv_tone_hz),
        wwvh_snr_db: measure(wwvh_tone_hz),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::tone::envelope;
    use hfts_common::model::SampleBlock;
    use num_complex::Complex32;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::TAU;

    // Minute-of-hour 0 of some hour
    const HOUR: i64 = 1_709_294_400;

    fn window_with(minute_start: i64, fs: u32, tones: &[(f64, f64, f64, f64)]) -> MinuteWindow {
        let mut rng = StdRng::seed_from_u64(5);
        let n = (60.5 * fs as f64) as usize;
        let samples = (0..n)
            .map(|i| {
                let t = i as f64 / fs as f64 - 0.5;
                let m: f64 = tones
                    .iter()
                    .filter(|(_, _, from, to)| t >= *from && t < *to)
                    .map(|(f, a, _, _)| a * (TAU * f * t).sin())
                    .sum();
                let noise: f64 = rng.gen_range(-0.05..0.05);
                Complex32::new((1.0 + m + noise) as f32, 0.0)
            })
            .collect();
        let block = SampleBlock::new(minute_start as f64 - 0.5, fs, samples);
        MinuteWindow::assemble(minute_start, fs, 0.5, &[block], Vec::new(), "t".into())
    }

    #[test]
    fn test_440_in_minute_two_is_wwv() {
        let minute = HOUR + 120;
        let window = window_with(minute, 4000, &[(440.0, 0.1, 1.0, 45.0)]);
        let env = envelope(&window);
        let id = detect_station_id(
            &window,
            &env,
            &DetectorConfig::default(),
            &[Station::Wwv, Station::Wwvh],
        )
        .unwrap();
        assert_eq!(id.station, Station::Wwv);
        assert!(id.detected);
    }

    #[test]
    fn test_no_440_outside_id_minutes() {
        let window = window_with(HOUR + 300, 4000, &[]);
        let env = envelope(&window);
        assert!(detect_station_id(
            &window,
            &env,
            &DetectorConfig::default(),
            &[Station::Wwv, Station::Wwvh]
        )
        .is_none());
    }

    #[test]
    fn test_test_signal_tones_above_nyquist_skipped() {
        let minute = HOUR + 8 * 60;
        let window = window_with(minute, 4000, &[]);
        let env = envelope(&window);
        let result = detect_test_signal(
            &window,
            &env,
            &DetectorConfig::default(),
            &[Station::Wwv, Station::Wwvh],
        )
        .unwrap();
        assert_eq!(result.station, Station::Wwv);
        assert_eq!(result.tones_evaluated, 0);
        assert!(!result.detected);
    }

    #[test]
    fn test_test_signal_detected_at_high_rate() {
        let minute = HOUR + 44 * 60;
        let tones: Vec<(f64, f64, f64, f64)> = [2000.0, 3000.0, 4000.0, 5000.0]
            .iter()
            .map(|f| (*f, 0.05, 13.0, 23.0))
            .collect();
        let window = window_with(minute, 12_000, &tones);
        let env = envelope(&window);
        let result = detect_test_signal(
            &window,
            &env,
            &DetectorConfig::default(),
            &[Station::Wwv, Station::Wwvh],
        )
        .unwrap();
        assert_eq!(result.station, Station::Wwvh);
        assert_eq!(result.tones_evaluated, 4);
        assert!(result.detected);
    }

    #[test]
    fn test_schedule_measures_both_tones() {
        // Minute 4: WWV 500 Hz, WWVH 600 Hz
        let window = window_with(HOUR + 240, 4000, &[(500.0, 0.1, 1.0, 45.0)]);
        let env = envelope(&window);
        let schedule = detect_schedule(&window, &env, &DetectorConfig::default()).unwrap();
        assert_eq!(schedule.wwv_tone_hz, 500.0);
        assert!(schedule.wwv_snr_db.unwrap() > 20.0);
        assert!(schedule.wwvh_snr_db.map(|s| s < 6.0).unwrap_or(true));
    }
}
