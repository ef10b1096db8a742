//! Second-tick correlation
//!
//! Ticks are integrated over fixed windows (10 s by default). Within a
//! window each tick gives one complex amplitude; those are combined both
//! coherently (phase-aligned sum) and incoherently (power sum). Coherent
//! integration wins only when it beats incoherent by the configured margin,
//! since ionospheric phase wander can make it collapse.

use super::profile::StationProfile;
use super::tone::{noise_density, parabolic_offset, NarrowbandSeries};
use super::{confidence_for_snr, DetectionMethod, MinuteWindow, ToneDetection};
use hfts_common::config::DetectorConfig;
use hfts_common::model::Station;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Half-width of the per-window lag scan
const LAG_SCAN_MS: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickWindow {
    pub start_s: u32,
    pub ticks: usize,
    /// Refined tick onset relative to the second boundary
    pub timing_error_ms: f64,
    pub coherent_snr_db: Option<f64>,
    pub incoherent_snr_db: Option<f64>,
    pub method: DetectionMethod,
    pub detected: bool,
}

impl TickWindow {
    pub fn snr_db(&self) -> Option<f64> {
        match self.method {
            DetectionMethod::TickCoherent => self.coherent_snr_db,
            _ => self.incoherent_snr_db,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickAnalysis {
    pub windows: Vec<TickWindow>,
    /// SNR-weighted timing over detected windows
    pub timing_error_ms: Option<f64>,
    pub snr_db: Option<f64>,
    pub method: Option<DetectionMethod>,
}

impl TickAnalysis {
    pub fn detection(&self, station: Station) -> Option<ToneDetection> {
        match (self.timing_error_ms, self.snr_db, self.method) {
            (Some(timing_error_ms), Some(snr_db), Some(method)) => Some(ToneDetection {
                station,
                timing_error_ms,
                snr_db,
                confidence: confidence_for_snr(snr_db),
                method,
            }),
            _ => None,
        }
    }

    pub fn detected_windows(&self) -> usize {
        self.windows.iter().filter(|w| w.detected).count()
    }
}

fn to_db(x: f64) -> Option<f64> {
    if x > 0.0 && x.is_finite() {
        Some(10.0 * x.log10())
    } else {
        None
    }
}

/// Correlate ticks around `reference_ms` (expected arrival after each second)
pub fn analyze_ticks(
    window: &MinuteWindow,
    env: &[f32],
    series: &NarrowbandSeries,
    profile: &StationProfile,
    config: &DetectorConfig,
    reference_ms: f64,
) -> TickAnalysis {
    let fs = window.sample_rate as f64;
    let tick_len = ((profile.tick_s * fs).round() as usize).max(1);
    let max_lag = (LAG_SCAN_MS * fs / 1000.0).round() as i64;
    let step = config.tick_window_s.max(1);

    let mut windows = Vec::new();
    let mut start_s = 0;
    while start_s < 60 {
        let seconds: Vec<u32> = profile
            .tick_seconds()
            .filter(|s| *s >= start_s && *s < start_s + step)
            .collect();
        if !seconds.is_empty() {
            let base: Vec<i64> = seconds
                .iter()
                .map(|&s| window.index_of(reference_ms / 1000.0 + s as f64))
                .collect();
            if let Some(result) =
                integrate_window(window, env, series, profile, config, &base, tick_len, max_lag)
            {
                windows.push(TickWindow {
                    start_s,
                    ticks: seconds.len(),
                    timing_error_ms: reference_ms + result.lag_samples * 1000.0 / fs,
                    ..result.window
                });
            }
        }
        start_s += step;
    }

    let detected: Vec<&TickWindow> = windows.iter().filter(|w| w.detected).collect();
    let mut analysis = TickAnalysis {
        windows: windows.clone(),
        ..Default::default()
    };
    if detected.is_empty() {
        return analysis;
    }

    let weights: Vec<f64> = detected
        .iter()
        .map(|w| 10f64.powf(w.snr_db().unwrap_or(0.0) / 10.0))
        .collect();
    let total: f64 = weights.iter().sum();
    analysis.timing_error_ms = Some(
        detected
            .iter()
            .zip(&weights)
            .map(|(w, k)| w.timing_error_ms * k)
            .sum::<f64>()
            / total,
    );
    analysis.snr_db = to_db(total);
    let coherent = detected
        .iter()
        .filter(|w| w.method == DetectionMethod::TickCoherent)
        .count();
    analysis.method = Some(if coherent * 2 >= detected.len() {
        DetectionMethod::TickCoherent
    } else {
        DetectionMethod::TickIncoherent
    });
    analysis
}

struct WindowResult {
    lag_samples: f64,
    window: TickWindow,
}

#[allow(clippy::too_many_arguments)]
fn integrate_window(
    window: &MinuteWindow,
    env: &[f32],
    series: &NarrowbandSeries,
    profile: &StationProfile,
    config: &DetectorConfig,
    base: &[i64],
    tick_len: usize,
    max_lag: i64,
) -> Option<WindowResult> {
    let limit = series.len() as i64 - tick_len as i64;
    let amplitudes = |lag: i64| -> Vec<Complex64> {
        base.iter()
            .map(|&b| b + lag)
            .filter(|&i| i >= 0 && i <= limit)
            .map(|i| series.mean(i, tick_len))
            .collect()
    };
    let incoherent = |lag: i64| -> f64 {
        let a = amplitudes(lag);
        if a.is_empty() {
            0.0
        } else {
            a.iter().map(|z| z.norm_sqr()).sum::<f64>() / a.len() as f64
        }
    };

    let scores: Vec<f64> = (-max_lag..=max_lag).map(incoherent).collect();
    let (best_i, _) = scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    let delta = if best_i > 0 && best_i + 1 < scores.len() {
        parabolic_offset(scores[best_i - 1], scores[best_i], scores[best_i + 1])
    } else {
        0.0
    };
    let best_lag = best_i as i64 - max_lag;

    let a = amplitudes(best_lag);
    let n = a.len();
    if n == 0 {
        return None;
    }
    let noise = noise_density(window, env, profile, &config.guard_offsets_hz) / tick_len as f64;
    if noise <= 0.0 {
        return None;
    }

    let coherent_sum: Complex64 = a.iter().sum();
    let coherent_power = coherent_sum.norm_sqr();
    let incoherent_power = a.iter().map(|z| z.norm_sqr()).sum::<f64>() / n as f64;

    let coherent_snr_db = to_db(coherent_power / (n as f64 * noise) - 1.0);
    let incoherent_snr_db = to_db((n as f64).sqrt() * (incoherent_power / noise - 1.0));

    let method = match (coherent_snr_db, incoherent_snr_db) {
        (Some(c), Some(i)) if c >= i + config.coherence_margin_db => DetectionMethod::TickCoherent,
        (Some(_), None) => DetectionMethod::TickCoherent,
        _ => DetectionMethod::TickIncoherent,
    };
    let chosen = match method {
        DetectionMethod::TickCoherent => coherent_snr_db,
        _ => incoherent_snr_db,
    };
    let detected = chosen.map(|s| s >= config.detection_snr_db).unwrap_or(false);

    Some(WindowResult {
        lag_samples: best_lag as f64 + delta,
        window: TickWindow {
            start_s: 0,
            ticks: n,
            timing_error_ms: 0.0,
            coherent_snr_db,
            incoherent_snr_db,
            method,
            detected,
        },
    })
}
