//! Transmission-time (propagation) solver
//!
//! Converts an observed arrival time into emission time by modelling the
//! radio path: ground wave, one E-layer hop, or one to three F-layer hops on
//! a spherical earth. Mode choice is deterministic in distance and carrier
//! frequency and always prefers the fewest hops that reach.

use hfts_common::config::SolverConfig;
use hfts_common::geo::{transmitter_location, GeoPoint, EARTH_RADIUS_KM};
use hfts_common::model::{PropagationMode, Station};
use hfts_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

/// Speed of light in km per millisecond
const C_KM_PER_MS: f64 = 299.792458;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropagationSolution {
    pub path_mode: PropagationMode,
    pub path_length_km: f64,
    pub propagation_delay_ms: f64,
    pub great_circle_distance_km: f64,
}

/// Solver bound to one receiver location and carrier frequency
#[derive(Debug, Clone)]
pub struct PropagationSolver {
    receiver: GeoPoint,
    frequency_mhz: f64,
    config: SolverConfig,
}

impl PropagationSolver {
    pub fn new(receiver: GeoPoint, frequency_mhz: f64, config: SolverConfig) -> Self {
        Self {
            receiver,
            frequency_mhz,
            config,
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Longest ground range one hop off a layer at `height_km` can cover
    pub fn max_hop_range_km(&self, height_km: f64) -> f64 {
        let r = EARTH_RADIUS_KM;
        let elevation = self.config.min_elevation_deg.to_radians();
        let incidence = (r * elevation.cos() / (r + height_km)).asin();
        2.0 * r * (FRAC_PI_2 - elevation - incidence)
    }

    fn layer_height(&self, mode: PropagationMode) -> f64 {
        match mode {
            PropagationMode::GroundWave => 0.0,
            PropagationMode::OneHopE => self.config.e_layer_height_km,
            PropagationMode::OneHopF | PropagationMode::TwoHopF | PropagationMode::ThreeHopF => {
                self.config.f_layer_height_km
            }
        }
    }

    /// Lowest-hop mode that physically reaches `distance_km`
    pub fn select_mode(&self, distance_km: f64) -> Result<PropagationMode> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            return Err(Error::UnphysicalSolution(format!(
                "Invalid path distance {}",
                distance_km
            )));
        }
        if distance_km <= self.config.ground_wave_max_km {
            return Ok(PropagationMode::GroundWave);
        }
        if distance_km <= self.max_hop_range_km(self.config.e_layer_height_km)
            && self.frequency_mhz <= self.config.e_layer_max_freq_mhz
        {
            return Ok(PropagationMode::OneHopE);
        }
        let f_range = self.max_hop_range_km(self.config.f_layer_height_km);
        for mode in [
            PropagationMode::OneHopF,
            PropagationMode::TwoHopF,
            PropagationMode::ThreeHopF,
        ] {
            if distance_km / mode.hops() as f64 <= f_range {
                return Ok(mode);
            }
        }
        Err(Error::UnphysicalSolution(format!(
            "{:.0} km exceeds three F-layer hops ({:.0} km each)",
            distance_km, f_range
        )))
    }

    /// Path for a given mode: `2N·sqrt((d/2N)² + h²)`, or `d` on the ground
    pub fn path_length_km(&self, mode: PropagationMode, distance_km: f64) -> f64 {
        let hops = mode.hops();
        if hops == 0 {
            return distance_km;
        }
        let legs = 2.0 * hops as f64;
        let h = self.layer_height(mode);
        legs * ((distance_km / legs).powi(2) + h * h).sqrt()
    }

    pub fn solve_distance(&self, distance_km: f64) -> Result<PropagationSolution> {
        let mode = self.select_mode(distance_km)?;
        let path_length_km = self.path_length_km(mode, distance_km);
        let iono_ms = if mode.hops() == 0 || self.frequency_mhz <= 0.0 {
            0.0
        } else {
            mode.hops() as f64 * self.config.iono_coeff_ms_mhz2 / self.frequency_mhz.powi(2)
        };
        let delay = path_length_km / C_KM_PER_MS + iono_ms;
        if !(delay > 0.0 && delay <= self.config.max_delay_ms) {
            return Err(Error::UnphysicalSolution(format!(
                "{} delay {:.3} ms outside (0, {}] ms",
                mode, delay, self.config.max_delay_ms
            )));
        }
        Ok(PropagationSolution {
            path_mode: mode,
            path_length_km,
            propagation_delay_ms: delay,
            great_circle_distance_km: distance_km,
        })
    }

    pub fn solve(&self, station: Station) -> Result<PropagationSolution> {
        let distance = self.receiver.distance_km(&transmitter_location(station));
        self.solve_distance(distance)
    }

    /// Mode-dependent model error
    pub fn mode_uncertainty_ms(mode: PropagationMode) -> f64 {
        match mode {
            PropagationMode::GroundWave => 0.05,
            PropagationMode::OneHopE => 0.2,
            PropagationMode::OneHopF => 0.3,
            PropagationMode::TwoHopF => 0.5,
            PropagationMode::ThreeHopF => 0.8,
        }
    }

    /// Total 1-sigma uncertainty of a clock offset
    ///
    /// Root-sum-square of a base term, SNR-driven timing jitter, the mode's
    /// model error and (when the station verdict is ambiguous) a penalty.
    pub fn uncertainty_ms(&self, mode: PropagationMode, snr_db: f64, ambiguous: bool) -> f64 {
        let snr_linear = 10f64.powf(snr_db / 10.0);
        let timing = if snr_linear > 0.0 {
            self.config.timing_scale_ms / snr_linear.sqrt()
        } else {
            f64::INFINITY
        };
        let ambiguity = if ambiguous {
            self.config.ambiguity_penalty_ms
        } else {
            0.0
        };
        (self.config.base_uncertainty_ms.powi(2)
            + timing.powi(2)
            + Self::mode_uncertainty_ms(mode).powi(2)
            + ambiguity.powi(2))
        .sqrt()
    }
}
