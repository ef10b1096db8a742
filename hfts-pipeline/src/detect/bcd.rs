//! 100 Hz BCD time-code correlation
//!
//! WWV and WWVH broadcast the same time code on a 100 Hz subcarrier, so the
//! code itself says nothing about which station is heard. What separates
//! them is arrival time: each station's code edges land at
//! `clock estimate + that station's propagation delay`. Correlating the
//! differentiated subcarrier envelope against the code's edge template at
//! both lags gives one amplitude per station.
//!
//! The clock estimate comes from the strongest minute marker; without a
//! marker there is no BCD evidence.

use super::tone::NarrowbandSeries;
use super::MinuteWindow;
use hfts_common::config::DetectorConfig;
use hfts_common::model::Station;
use hfts_common::time::utc_fields;
use serde::{Deserialize, Serialize};

pub const SUBCARRIER_HZ: f64 = 100.0;

/// Subcarrier is blanked for this long at the start of every second
pub const PULSE_BLANK_S: f64 = 0.030;

/// Search half-width around each expected lag
const LAG_SCAN_MS: i64 = 3;

/// Noise probe offsets relative to each expected lag
const NOISE_LAGS_MS: [i64; 4] = [-90, -60, 60, 90];

/// A window counts only if its peak clears the noise by this factor
const VALID_FACTOR: f64 = 3.0;

const SMOOTHING_S: f64 = 0.010;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BcdSymbol {
    /// No pulse (second 0)
    Empty,
    Zero,
    One,
    Marker,
}

impl BcdSymbol {
    /// End of the subcarrier pulse, seconds into the second
    pub fn pulse_end_s(&self) -> Option<f64> {
        match self {
            BcdSymbol::Empty => None,
            BcdSymbol::Zero => Some(0.2),
            BcdSymbol::One => Some(0.5),
            BcdSymbol::Marker => Some(0.8),
        }
    }
}

fn put_bcd(code: &mut [BcdSymbol; 60], seconds: &[usize], value: u32) {
    for (bit, &second) in seconds.iter().enumerate() {
        code[second] = if value & (1 << bit) != 0 {
            BcdSymbol::One
        } else {
            BcdSymbol::Zero
        };
    }
}

/// WWV-format time code for a UTC minute
///
/// DST, leap-second and DUT1 fields are sent as zeros.
pub fn time_code(minute_start: i64) -> [BcdSymbol; 60] {
    let fields = utc_fields(minute_start);
    let year = fields.year.rem_euclid(100) as u32;
    let day = fields.day_of_year;

    let mut code = [BcdSymbol::Zero; 60];
    code[0] = BcdSymbol::Empty;
    for marker in [9, 19, 29, 39, 49, 59] {
        code[marker] = BcdSymbol::Marker;
    }
    put_bcd(&mut code, &[4, 5, 6, 7], year % 10);
    put_bcd(&mut code, &[10, 11, 12, 13], fields.minute % 10);
    put_bcd(&mut code, &[15, 16, 17], fields.minute / 10);
    put_bcd(&mut code, &[20, 21, 22, 23], fields.hour % 10);
    put_bcd(&mut code, &[25, 26], fields.hour / 10);
    put_bcd(&mut code, &[30, 31, 32, 33], day % 10);
    put_bcd(&mut code, &[35, 36, 37, 38], (day / 10) % 10);
    put_bcd(&mut code, &[40, 41], day / 100);
    put_bcd(&mut code, &[51, 52, 53, 54], year / 10);
    code
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BcdWindow {
    pub start_s: u32,
    pub wwv_amplitude: f64,
    pub wwvh_amplitude: f64,
    pub noise: f64,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BcdAnalysis {
    pub windows: Vec<BcdWindow>,
    pub valid_windows: usize,
    pub wwv_amplitude: f64,
    pub wwvh_amplitude: f64,
    pub noise: f64,
    /// `20·log10((A_wwv + noise) / (A_wwvh + noise))` over valid windows
    pub ratio_db: Option<f64>,
    pub wwv_lag_ms: f64,
    pub wwvh_lag_ms: f64,
}

/// Differentiated, smoothed subcarrier magnitude on a 1 ms grid
struct EdgeTrack {
    /// Grid value of `d[0]`, ms relative to the minute
    first_ms: i64,
    d: Vec<f64>,
}

impl EdgeTrack {
    fn new(window: &MinuteWindow, env: &[f32]) -> Self {
        let series = NarrowbandSeries::new(env, window.sample_rate, SUBCARRIER_HZ);
        let smooth = ((SMOOTHING_S * window.sample_rate as f64).round() as usize).max(1);
        let first_ms = -(window.pre_margin_s * 1000.0).floor() as i64;
        let last_ms = 60_000i64;

        let magnitude: Vec<f64> = (first_ms..last_ms)
            .map(|k| {
                let centre = window.index_of(k as f64 / 1000.0);
                series.mean(centre - smooth as i64 / 2, smooth).norm()
            })
            .collect();

        let mut d = vec![0.0; magnitude.len()];
        for k in 1..magnitude.len().saturating_sub(1) {
            d[k] = magnitude[k + 1] - magnitude[k - 1];
        }
        Self { first_ms, d }
    }

    fn at(&self, ms: i64) -> Option<f64> {
        let i = ms - self.first_ms;
        if i < 1 || i as usize + 1 >= self.d.len() {
            None
        } else {
            Some(self.d[i as usize])
        }
    }

    /// Template correlation per edge at integer lag `lag_ms`
    fn correlate(&self, edges: &[(i64, f64)], lag_ms: i64) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for &(at_ms, sign) in edges {
            if let Some(v) = self.at(at_ms + lag_ms) {
                total += sign * v;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }
}

/// Rise (+1) and fall (-1) edge times in ms for seconds `[start, end)`
fn edge_template(code: &[BcdSymbol; 60], start_s: u32, end_s: u32) -> Vec<(i64, f64)> {
    let mut edges = Vec::new();
    for s in start_s..end_s.min(60) {
        if let Some(end) = code[s as usize].pulse_end_s() {
            let base = s as f64 * 1000.0;
            edges.push(((base + PULSE_BLANK_S * 1000.0).round() as i64, 1.0));
            edges.push(((base + end * 1000.0).round() as i64, -1.0));
        }
    }
    edges
}

/// Correlate the time code at the predicted WWV and WWVH lags
///
/// `expected_ms` holds each station's predicted code arrival relative to the
/// system-time minute boundary.
pub fn analyze_bcd(
    window: &MinuteWindow,
    env: &[f32],
    config: &DetectorConfig,
    expected_ms: &[(Station, f64)],
) -> Option<BcdAnalysis> {
    let lag_of = |station: Station| {
        expected_ms
            .iter()
            .find(|(s, _)| *s == station)
            .map(|(_, ms)| *ms)
    };
    let wwv_lag_ms = lag_of(Station::Wwv)?;
    let wwvh_lag_ms = lag_of(Station::Wwvh)?;

    let code = time_code(window.minute_start);
    let track = EdgeTrack::new(window, env);
    let span = config.bcd_window_s.max(1);
    let step = config.bcd_step_s.max(1) as usize;

    let peak = |edges: &[(i64, f64)], expected: f64| -> f64 {
        let centre = expected.round() as i64;
        (centre - LAG_SCAN_MS..=centre + LAG_SCAN_MS)
            .map(|lag| track.correlate(edges, lag))
            .fold(f64::MIN, f64::max)
            .max(0.0)
    };

    let mut windows = Vec::new();
    for start_s in (0..=60u32.saturating_sub(span)).step_by(step) {
        let edges = edge_template(&code, start_s, start_s + span);
        if edges.is_empty() {
            continue;
        }
        let wwv_amplitude = peak(&edges, wwv_lag_ms);
        let wwvh_amplitude = peak(&edges, wwvh_lag_ms);

        let probes: Vec<f64> = [wwv_lag_ms, wwvh_lag_ms]
            .iter()
            .flat_map(|e| NOISE_LAGS_MS.iter().map(move |o| e.round() as i64 + o))
            .map(|lag| track.correlate(&edges, lag).abs())
            .collect();
        let noise = probes.iter().sum::<f64>() / probes.len() as f64;

        let valid = noise > 0.0 && wwv_amplitude.max(wwvh_amplitude) >= VALID_FACTOR * noise;
        windows.push(BcdWindow {
            start_s,
            wwv_amplitude,
            wwvh_amplitude,
            noise,
            valid,
        });
    }

    let valid: Vec<&BcdWindow> = windows.iter().filter(|w| w.valid).collect();
    let mean = |f: &dyn Fn(&BcdWindow) -> f64| -> f64 {
        if valid.is_empty() {
            0.0
        } else {
            valid.iter().map(|w| f(w)).sum::<f64>() / valid.len() as f64
        }
    };
    let wwv_amplitude = mean(&|w| w.wwv_amplitude);
    let wwvh_amplitude = mean(&|w| w.wwvh_amplitude);
    let noise = mean(&|w| w.noise);
    let ratio_db = if valid.is_empty() || noise <= 0.0 {
        None
    } else {
        Some(20.0 * ((wwv_amplitude + noise) / (wwvh_amplitude + noise)).log10())
    };

    Some(BcdAnalysis {
        valid_windows: valid.len(),
        windows,
        wwv_amplitude,
        wwvh_amplitude,
        noise,
        ratio_db,
        wwv_lag_ms,
        wwvh_lag_ms,
    })
}
