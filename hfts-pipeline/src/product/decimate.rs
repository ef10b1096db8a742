//! Multistage decimation
//!
//! Each stage is a Blackman-windowed sinc low-pass followed by keep-one-in-D.
//! Filters are centred on the kept sample, so decimation adds no delay, and
//! kept samples sit at absolute grid indices that are multiples of the
//! cumulative factor. The same input sample therefore always maps to the same
//! output sample, whatever range a job happens to start at.

use hfts_common::{Error, Result};
use num_complex::{Complex32, Complex64};
use std::f64::consts::PI;

/// Largest factor handled by one stage
pub const MAX_STAGE_FACTOR: u32 = 20;

/// Filter half-length per unit of stage factor
const TAPS_PER_FACTOR: usize = 4;

/// Passband edge as a fraction of the output Nyquist frequency
const CUTOFF_FRACTION: f64 = 0.9;

/// One low-pass + downsample stage
#[derive(Debug, Clone, PartialEq)]
pub struct FirStage {
    pub factor: u32,
    taps: Vec<f64>,
}

impl FirStage {
    pub fn new(factor: u32) -> Self {
        let half = TAPS_PER_FACTOR * factor as usize;
        let len = 2 * half + 1;
        // Cutoff in cycles per input sample
        let fc = CUTOFF_FRACTION * 0.5 / factor as f64;
        let mut taps: Vec<f64> = (0..len)
            .map(|i| {
                let n = i as f64 - half as f64;
                let sinc = if n == 0.0 {
                    2.0 * fc
                } else {
                    (2.0 * PI * fc * n).sin() / (PI * n)
                };
                let x = i as f64 / (len - 1) as f64;
                let blackman = 0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos();
                sinc * blackman
            })
            .collect();
        let gain: f64 = taps.iter().sum();
        for t in &mut taps {
            *t /= gain;
        }
        Self { factor, taps }
    }

    pub fn half_len(&self) -> usize {
        self.taps.len() / 2
    }

    pub fn taps(&self) -> &[f64] {
        &self.taps
    }

    /// Filter and downsample a signal whose first sample sits at grid index
    /// `first`; returns the output grid index of the first output sample
    pub fn apply(&self, first: i64, input: &[Complex32]) -> (i64, Vec<Complex32>) {
        let d = self.factor as i64;
        let half = self.half_len() as i64;
        let last = first + input.len() as i64;
        let out_first = ceil_div(first, d);
        let out_end = ceil_div(last, d);

        let output = (out_first..out_end)
            .map(|k| {
                let centre = k * d;
                let mut acc = Complex64::new(0.0, 0.0);
                for (j, tap) in self.taps.iter().enumerate() {
                    let idx = centre + j as i64 - half - first;
                    if idx >= 0 && (idx as usize) < input.len() {
                        let x = input[idx as usize];
                        acc += Complex64::new(x.re as f64, x.im as f64) * *tap;
                    }
                }
                Complex32::new(acc.re as f32, acc.im as f32)
            })
            .collect();
        (out_first, output)
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    -((-a).div_euclid(b))
}

/// Cascade of stages whose factors multiply to the total
#[derive(Debug, Clone, PartialEq)]
pub struct DecimationPlan {
    pub total_factor: u32,
    stages: Vec<FirStage>,
}

impl DecimationPlan {
    /// Split `total_factor` into stages of at most [`MAX_STAGE_FACTOR`]
    pub fn new(total_factor: u32) -> Result<Self> {
        if total_factor < 2 {
            return Err(Error::Config(format!(
                "Decimation factor {} must be at least 2",
                total_factor
            )));
        }
        let mut primes = Vec::new();
        let mut n = total_factor;
        let mut p = 2;
        while n > 1 {
            while n % p == 0 {
                primes.push(p);
                n /= p;
            }
            p += 1;
            if p * p > n && n > 1 {
                primes.push(n);
                break;
            }
        }
        if let Some(big) = primes.iter().find(|p| **p > MAX_STAGE_FACTOR) {
            return Err(Error::Config(format!(
                "Decimation factor {} has prime factor {} above {}",
                total_factor, big, MAX_STAGE_FACTOR
            )));
        }

        // First-fit decreasing keeps the stage count low
        primes.sort_unstable_by(|a, b| b.cmp(a));
        let mut factors: Vec<u32> = Vec::new();
        for p in primes {
            match factors.iter_mut().find(|f| **f * p <= MAX_STAGE_FACTOR) {
                Some(f) => *f *= p,
                None => factors.push(p),
            }
        }
        factors.sort_unstable_by(|a, b| b.cmp(a));

        Ok(Self {
            total_factor,
            stages: factors.into_iter().map(FirStage::new).collect(),
        })
    }

    pub fn stages(&self) -> &[FirStage] {
        &self.stages
    }

    pub fn stage_factors(&self) -> Vec<u32> {
        self.stages.iter().map(|s| s.factor).collect()
    }

    /// Input samples each side that influence an output sample
    pub fn margin_samples(&self) -> usize {
        let mut scale = 1usize;
        let mut margin = 0usize;
        for stage in &self.stages {
            margin += stage.half_len() * scale;
            scale *= stage.factor as usize;
        }
        margin
    }

    /// Run the cascade; `first` is the absolute input grid index of
    /// `input[0]`. Returns the absolute output grid index of the first
    /// output sample (output index `k` sits at input index `k * total`).
    pub fn apply(&self, first: i64, input: &[Complex32]) -> (i64, Vec<Complex32>) {
        let mut index = first;
        let mut signal = input.to_vec();
        for stage in &self.stages {
            let (next, out) = stage.apply(index, &signal);
            index = next;
            signal = out;
        }
        (index, signal)
    }
}
