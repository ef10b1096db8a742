//! Synthetic WWV/WWVH/CHU broadcasts
//!
//! Generates complex baseband with the stations' audio formats AM-modulated
//! on the carrier, as seen by a receiver whose clock runs `clock_offset_ms`
//! ahead of UTC. Used by the test suites and the `simulate` command.

use crate::detect::bcd::{time_code, PULSE_BLANK_S, SUBCARRIER_HZ};
use crate::detect::profile::{schedule_excluded, StationProfile};
use crate::detect::station_id::STATION_ID_HZ;
use hfts_common::model::{SampleBlock, Station};
use hfts_common::time::{minute_of_hour, SECONDS_PER_MINUTE};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;

const TEST_SIGNAL_TONES_HZ: [f64; 4] = [2000.0, 3000.0, 4000.0, 5000.0];

/// One transmitter as heard at the receiver
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStation {
    pub station: Station,
    pub propagation_delay_ms: f64,
    /// Modulation depth of the marker and tick tones
    pub amplitude: f64,
    /// BCD subcarrier depth relative to `amplitude`
    pub bcd_level: f64,
}

impl SyntheticStation {
    pub fn new(station: Station, propagation_delay_ms: f64, amplitude: f64) -> Self {
        Self {
            station,
            propagation_delay_ms,
            amplitude,
            bcd_level: 0.5,
        }
    }

    pub fn without_bcd(mut self) -> Self {
        self.bcd_level = 0.0;
        self
    }

    /// Audio modulation at UTC time `t` (emission time), band-limited below
    /// `nyquist_hz`
    fn modulation(&self, profile: &StationProfile, t: f64, nyquist_hz: f64) -> f64 {
        let utc_minute = (t / SECONDS_PER_MINUTE as f64).floor() as i64 * SECONDS_PER_MINUTE;
        let into_minute = t - utc_minute as f64;
        let second = into_minute.floor() as u32;
        let frac = into_minute - second as f64;
        let tone = |f: f64| (TAU * f * frac).sin();
        let minute = minute_of_hour(utc_minute);

        let mut m = 0.0;
        if second == 0 && frac < profile.marker_s {
            m += self.amplitude * tone(profile.tone_hz);
        } else if frac < profile.tick_s && profile.tick_seconds().any(|s| s == second) {
            m += self.amplitude * tone(profile.tone_hz);
        }

        if profile.has_bcd && self.bcd_level > 0.0 {
            let code = time_code(utc_minute);
            if let Some(end) = code[second.min(59) as usize].pulse_end_s() {
                if frac >= PULSE_BLANK_S && frac < end {
                    m += self.amplitude * self.bcd_level * tone(SUBCARRIER_HZ);
                }
            }
        }

        // Audio tones pause around each tick
        let audio_window = (1..45).contains(&second) && (0.03..0.99).contains(&frac);
        if audio_window && profile.station_id_minute == Some(minute) {
            m += 0.5 * self.amplitude * tone(STATION_ID_HZ);
        }
        if (13..23).contains(&second) && profile.test_signal_minute == Some(minute) {
            for f in TEST_SIGNAL_TONES_HZ.iter().filter(|f| **f < nyquist_hz) {
                m += 0.25 * self.amplitude * tone(*f);
            }
        }
        if audio_window && !schedule_excluded(minute) {
            if let Some(f) = profile.schedule_tone_hz(minute) {
                m += 0.3 * self.amplitude * tone(f);
            }
        }
        m
    }
}

/// Receiver-side view of one system-time minute
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticMinute {
    pub minute_start: i64,
    pub sample_rate: u32,
    /// system - UTC
    pub clock_offset_ms: f64,
    pub noise_amplitude: f64,
    pub seed: u64,
    stations: Vec<SyntheticStation>,
}

impl SyntheticMinute {
    pub fn new(minute_start: i64, sample_rate: u32, clock_offset_ms: f64) -> Self {
        Self {
            minute_start,
            sample_rate,
            clock_offset_ms,
            noise_amplitude: 0.05,
            seed: 0x5eed,
            stations: Vec::new(),
        }
    }

    pub fn with_station(mut self, station: SyntheticStation) -> Self {
        self.stations.push(station);
        self
    }

    pub fn with_noise(mut self, noise_amplitude: f64) -> Self {
        self.noise_amplitude = noise_amplitude;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn stations(&self) -> &[SyntheticStation] {
        &self.stations
    }

    /// Samples on the absolute system-time grid starting at `first_index`
    pub fn generate(&self, first_index: i64, count: usize) -> Vec<Complex32> {
        let fs = self.sample_rate as f64;
        let mut rng = StdRng::seed_from_u64(self.seed ^ first_index as u64);
        let profiles: Vec<StationProfile> = self
            .stations
            .iter()
            .map(|s| StationProfile::for_station(s.station))
            .collect();

        (0..count)
            .map(|i| {
                let system_time = (first_index + i as i64) as f64 / fs;
                let utc = system_time - self.clock_offset_ms / 1000.0;
                let m: f64 = self
                    .stations
                    .iter()
                    .zip(&profiles)
                    .map(|(s, p)| {
                        s.modulation(p, utc - s.propagation_delay_ms / 1000.0, fs / 2.0)
                    })
                    .sum();
                let (n_re, n_im) = gaussian_pair(&mut rng);
                Complex32::new(
                    ((1.0 + m) + self.noise_amplitude * n_re) as f32,
                    (self.noise_amplitude * n_im) as f32,
                )
            })
            .collect()
    }

    /// Block covering system time `[start, end)`, aligned to the sample grid
    pub fn block_range(&self, start: f64, end: f64) -> SampleBlock {
        let fs = self.sample_rate as f64;
        let first = (start * fs).round() as i64;
        let last = (end * fs).round() as i64;
        let samples = self.generate(first, (last - first).max(0) as usize);
        SampleBlock::new(first as f64 / fs, self.sample_rate, samples)
    }

    /// Exactly this system-time minute
    pub fn minute_block(&self) -> SampleBlock {
        let start = self.minute_start as f64;
        self.block_range(start, start + SECONDS_PER_MINUTE as f64)
    }

    /// The minute plus one second of lead-in
    pub fn block(&self) -> SampleBlock {
        let start = self.minute_start as f64;
        self.block_range(start - 1.0, start + SECONDS_PER_MINUTE as f64)
    }
}

/// Box-Muller standard normal pair
fn gaussian_pair(rng: &mut StdRng) -> (f64, f64) {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let r = (-2.0 * u1.ln()).sqrt();
    (r * (TAU * u2).cos(), r * (TAU * u2).sin())
}
