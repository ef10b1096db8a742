//! Narrowband tone measurement and minute-marker timing
//!
//! A tone at `f` is measured by mixing the envelope down with `e^{-j2πfn/fs}`
//! and averaging over a boxcar. The mixing phase is always referenced to the
//! absolute grid index so sums over different ranges stay phase-coherent.
//!
//! Noise floor comes from the same measurement at fixed guard offsets around
//! the tone, never from the tone bin itself.

use super::profile::StationProfile;
use super::MinuteWindow;
use hfts_common::config::DetectorConfig;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// AM envelope with its mean removed; missing samples are zero
pub fn envelope(window: &MinuteWindow) -> Vec<f32> {
    let mut env: Vec<f32> = window.samples.iter().map(|z| z.norm()).collect();
    let (sum, count) = env
        .iter()
        .zip(&window.present)
        .filter(|(_, p)| **p)
        .fold((0.0f64, 0usize), |(s, c), (v, _)| (s + *v as f64, c + 1));
    let mean = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };
    for (v, present) in env.iter_mut().zip(&window.present) {
        *v = if *present { *v - mean } else { 0.0 };
    }
    env
}

/// Local oscillator value at grid index `n`
fn phasor(freq_hz: f64, sample_rate: f64, n: usize) -> Complex64 {
    let cycles = (freq_hz * n as f64 / sample_rate).fract();
    Complex64::from_polar(1.0, -TAU * cycles)
}

/// Prefix sums of the envelope mixed down from one frequency
///
/// Gives O(1) boxcar sums at any position, used for the sliding marker
/// search and the tick/BCD lag scans.
pub struct NarrowbandSeries {
    prefix: Vec<Complex64>,
}

impl NarrowbandSeries {
    pub fn new(env: &[f32], sample_rate: u32, freq_hz: f64) -> Self {
        let fs = sample_rate as f64;
        let step = Complex64::from_polar(1.0, -TAU * freq_hz / fs);
        let mut prefix = Vec::with_capacity(env.len() + 1);
        let mut acc = Complex64::new(0.0, 0.0);
        let mut lo = Complex64::new(1.0, 0.0);
        prefix.push(acc);
        for (n, &x) in env.iter().enumerate() {
            acc += lo * x as f64;
            prefix.push(acc);
            lo *= step;
            if n % 4096 == 4095 {
                // Re-seed to stop the recurrence drifting
                lo = phasor(freq_hz, fs, n + 1);
            }
        }
        Self { prefix }
    }

    pub fn len(&self) -> usize {
        self.prefix.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum over `[start, start + len)`, clamped to the series
    pub fn sum(&self, start: i64, len: usize) -> Complex64 {
        let n = self.len() as i64;
        let a = start.clamp(0, n) as usize;
        let b = (start + len as i64).clamp(0, n) as usize;
        self.prefix[b] - self.prefix[a]
    }

    pub fn mean(&self, start: i64, len: usize) -> Complex64 {
        if len == 0 {
            return Complex64::new(0.0, 0.0);
        }
        self.sum(start, len) / len as f64
    }
}

/// Direct boxcar mean at one frequency (for sparse guard probes)
pub fn narrowband_mean(
    env: &[f32],
    sample_rate: u32,
    freq_hz: f64,
    start: usize,
    len: usize,
) -> Complex64 {
    let end = (start + len).min(env.len());
    if start >= end {
        return Complex64::new(0.0, 0.0);
    }
    let fs = sample_rate as f64;
    let step = Complex64::from_polar(1.0, -TAU * freq_hz / fs);
    let mut lo = phasor(freq_hz, fs, start);
    let mut acc = Complex64::new(0.0, 0.0);
    for &x in &env[start..end] {
        acc += lo * x as f64;
        lo *= step;
    }
    acc / len as f64
}

/// Mean boxcar power at the guard offsets around `freq_hz`
pub fn guard_power(
    env: &[f32],
    sample_rate: u32,
    freq_hz: f64,
    guard_offsets_hz: &[f64],
    starts: &[usize],
    len: usize,
) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for offset in guard_offsets_hz {
        let f = freq_hz + offset;
        if f <= 0.0 || f >= sample_rate as f64 / 2.0 {
            continue;
        }
        for &start in starts {
            total += narrowband_mean(env, sample_rate, f, start, len).norm_sqr();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Per-sample noise power near the station tone
///
/// Measured in the guard bands over stretches between ticks, then scaled by
/// the caller to its own boxcar length (white noise power goes as 1/len).
pub fn noise_density(
    window: &MinuteWindow,
    env: &[f32],
    profile: &StationProfile,
    guard_offsets_hz: &[f64],
) -> f64 {
    let fs = window.sample_rate;
    let len = (0.4 * fs as f64).round() as usize;
    let quiet_offset = profile.tick_s + 0.2;
    let starts: Vec<usize> = (1..59)
        .step_by(3)
        .map(|s| window.index_of(s as f64 + quiet_offset).max(0) as usize)
        .filter(|&i| i + len <= env.len())
        .collect();
    guard_power(env, fs, profile.tone_hz, guard_offsets_hz, &starts, len) * len as f64
}

/// Excess-power SNR in dB; `None` when the signal does not exceed noise
pub fn snr_db(signal_power: f64, noise_power: f64) -> Option<f64> {
    if noise_power <= 0.0 || !signal_power.is_finite() {
        return None;
    }
    let snr = (signal_power - noise_power) / noise_power;
    if snr > 0.0 {
        Some(10.0 * snr.log10())
    } else {
        None
    }
}

/// Vertex offset (in samples, within ±0.5) of a parabola through three points
pub fn parabolic_offset(y_prev: f64, y_peak: f64, y_next: f64) -> f64 {
    let denom = y_prev - 2.0 * y_peak + y_next;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (0.5 * (y_prev - y_next) / denom).clamp(-0.5, 0.5)
}

/// Incoherent band power SNR over `[start_s, end_s)` after the minute
///
/// Averages 1 s boxcar powers so slow phase wander does not cost signal.
pub fn band_power_snr_db(
    window: &MinuteWindow,
    env: &[f32],
    freq_hz: f64,
    start_s: u32,
    end_s: u32,
    guard_offsets_hz: &[f64],
) -> Option<f64> {
    let fs = window.sample_rate;
    if freq_hz >= fs as f64 / 2.0 {
        return None;
    }
    let chunk = fs as usize;
    let starts: Vec<usize> = (start_s..end_s)
        .map(|s| window.index_of(s as f64).max(0) as usize)
        .filter(|&i| i + chunk <= env.len())
        .collect();
    if starts.is_empty() {
        return None;
    }
    let signal = starts
        .iter()
        .map(|&i| narrowband_mean(env, fs, freq_hz, i, chunk).norm_sqr())
        .sum::<f64>()
        / starts.len() as f64;
    let noise = guard_power(env, fs, freq_hz, guard_offsets_hz, &starts, chunk);
    snr_db(signal, noise)
}

/// Outcome of the minute-marker search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSearch {
    /// Refined marker onset relative to the minute boundary
    pub timing_error_ms: f64,
    pub signal_power: f64,
    pub noise_power: f64,
    pub snr_db: Option<f64>,
    pub detected: bool,
}

/// Locate the minute marker with a sliding boxcar of marker length
pub fn locate_marker(
    window: &MinuteWindow,
    env: &[f32],
    series: &NarrowbandSeries,
    profile: &StationProfile,
    config: &DetectorConfig,
) -> MarkerSearch {
    let fs = window.sample_rate;
    let marker_len = (profile.marker_s * fs as f64).round() as usize;
    let first = window.index_of(-window.pre_margin_s).max(0);
    let last = window
        .index_of(1.0)
        .min(series.len() as i64 - marker_len as i64);

    let mut best_k = first;
    let mut best = -1.0f64;
    for k in first..last.max(first) {
        let p = series.sum(k, marker_len).norm_sqr();
        if p > best {
            best = p;
            best_k = k;
        }
    }

    let magnitude = |k: i64| series.sum(k, marker_len).norm();
    let delta = if best_k > first && best_k + 1 < last {
        parabolic_offset(magnitude(best_k - 1), magnitude(best_k), magnitude(best_k + 1))
    } else {
        0.0
    };
    let timing_error_ms = window.seconds_at(best_k as f64 + delta) * 1000.0;

    let signal_power = series.mean(best_k, marker_len).norm_sqr();
    let noise_power =
        noise_density(window, env, profile, &config.guard_offsets_hz) / marker_len as f64;

    let snr = snr_db(signal_power, noise_power);
    let detected = snr.map(|s| s >= config.detection_snr_db).unwrap_or(false);

    MarkerSearch {
        timing_error_ms,
        signal_power,
        noise_power,
        snr_db: snr,
        detected,
    }
}
