//! Configuration loading and root folder resolution
//!
//! Every section carries `#[serde(default)]` so an empty TOML file yields the
//! documented defaults. Thresholds are plain parameters, not physical
//! constants; the reprocessor relies on being able to change them per
//! algorithm version.

use crate::geo::{grid_square_to_point, GeoPoint};
use crate::model::Station;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable consulted for the data root
pub const ROOT_ENV_VAR: &str = "HFTS_ROOT";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub root_folder: Option<PathBuf>,
    pub receiver: ReceiverConfig,
    pub channels: Vec<ChannelConfig>,
    pub detector: DetectorConfig,
    pub discriminator: DiscriminatorConfig,
    pub solver: SolverConfig,
    pub series: SeriesConfig,
    pub product: ProductConfig,
    pub pipeline: OrchestratorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub grid_square: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            grid_square: "EM38".to_string(),
            latitude: None,
            longitude: None,
        }
    }
}

impl ReceiverConfig {
    /// Explicit coordinates win over the grid square
    pub fn location(&self) -> Result<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Ok(GeoPoint::new(lat, lon)),
            _ => grid_square_to_point(&self.grid_square),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    pub frequency_mhz: f64,
    pub sample_rate: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "WWV_10_MHz".to_string(),
            frequency_mhz: 10.0,
            sample_rate: 20_000,
        }
    }
}

impl ChannelConfig {
    /// Stations that can be heard on this carrier
    pub fn candidate_stations(&self) -> Vec<Station> {
        let f = self.frequency_mhz;
        let near = |target: f64| (f - target).abs() < 0.01;
        if [2.5, 5.0, 10.0, 15.0].iter().any(|t| near(*t)) {
            vec![Station::Wwv, Station::Wwvh]
        } else if [20.0, 25.0].iter().any(|t| near(*t)) {
            vec![Station::Wwv]
        } else if [3.33, 7.85, 14.67].iter().any(|t| near(*t)) {
            vec![Station::Chu]
        } else {
            Vec::new()
        }
    }

    pub fn is_shared_frequency(&self) -> bool {
        self.candidate_stations().len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum tone SNR for a detection
    pub detection_snr_db: f64,
    /// Coherent integration must beat incoherent by this much
    pub coherence_margin_db: f64,
    pub tick_window_s: u32,
    pub bcd_window_s: u32,
    pub bcd_step_s: u32,
    /// Noise-floor probe offsets relative to each tone
    pub guard_offsets_hz: Vec<f64>,
    /// Seconds of the previous minute included in the marker search
    pub pre_minute_margin_s: f64,
    /// Minimum fraction of the minute that must be present
    pub min_coverage: f64,
    pub test_signal_tones_hz: Vec<f64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_snr_db: 6.0,
            coherence_margin_db: 3.0,
            tick_window_s: 10,
            bcd_window_s: 15,
            bcd_step_s: 1,
            guard_offsets_hz: vec![-60.0, -45.0, -30.0, 30.0, 45.0, 60.0],
            pre_minute_margin_s: 0.5,
            min_coverage: 0.5,
            test_signal_tones_hz: vec![2000.0, 3000.0, 4000.0, 5000.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    pub dominance_threshold_db: f64,
    /// Clamp applied to each individual vote
    pub max_vote_db: f64,
    /// A vote at least this large counts as corroborating
    pub corroboration_min_db: f64,
    pub weight_tone_snr: f64,
    pub weight_bcd: f64,
    pub weight_station_id: f64,
    pub weight_test_signal: f64,
    pub weight_tone_schedule: f64,
    /// dB-equivalent magnitude of a presence-only vote (440 Hz, test signal)
    pub presence_vote_db: f64,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            dominance_threshold_db: 3.0,
            max_vote_db: 20.0,
            corroboration_min_db: 1.0,
            weight_tone_snr: 1.0,
            weight_bcd: 0.8,
            weight_station_id: 0.6,
            weight_test_signal: 0.6,
            weight_tone_schedule: 0.5,
            presence_vote_db: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub e_layer_height_km: f64,
    pub f_layer_height_km: f64,
    pub min_elevation_deg: f64,
    pub ground_wave_max_km: f64,
    pub e_layer_max_freq_mhz: f64,
    /// Group-retardation coefficient per hop, ms·MHz²
    pub iono_coeff_ms_mhz2: f64,
    pub max_delay_ms: f64,
    /// Timing jitter scale for unit SNR
    pub timing_scale_ms: f64,
    pub base_uncertainty_ms: f64,
    /// Added when the station verdict is ambiguous
    pub ambiguity_penalty_ms: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            e_layer_height_km: 110.0,
            f_layer_height_km: 300.0,
            min_elevation_deg: 6.0,
            ground_wave_max_km: 200.0,
            e_layer_max_freq_mhz: 5.0,
            iono_coeff_ms_mhz2: 10.0,
            max_delay_ms: 60.0,
            timing_scale_ms: 5.0,
            base_uncertainty_ms: 0.1,
            ambiguity_penalty_ms: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    pub cadence_s: f64,
    pub staleness_multiplier: f64,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            cadence_s: 60.0,
            staleness_multiplier: 2.0,
        }
    }
}

impl SeriesConfig {
    pub fn staleness_window_s(&self) -> f64 {
        self.cadence_s * self.staleness_multiplier
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductConfig {
    pub decimation_factor: u32,
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            decimation_factor: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub analysis_timeout_s: f64,
    pub product_latency_s: f64,
    pub algorithm_version: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_s: 60.0,
            product_latency_s: 120.0,
            algorithm_version: "v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        self.receiver.location()?;

        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(Error::Config("Channel name must not be empty".to_string()));
            }
            if channel.sample_rate == 0 {
                return Err(Error::Config(format!(
                    "Channel {} has zero sample rate",
                    channel.name
                )));
            }
            if channel.frequency_mhz <= 0.0 {
                return Err(Error::Config(format!(
                    "Channel {} has non-positive frequency",
                    channel.name
                )));
            }
        }

        if self.product.decimation_factor < 2 {
            return Err(Error::Config(
                "Decimation factor must be at least 2".to_string(),
            ));
        }
        if self.series.cadence_s <= 0.0 || self.series.staleness_multiplier <= 0.0 {
            return Err(Error::Config(
                "Series cadence and staleness multiplier must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.min_coverage) {
            return Err(Error::Config("min_coverage must be within 0..=1".to_string()));
        }
        if self.detector.tick_window_s == 0 || self.detector.bcd_window_s == 0 {
            return Err(Error::Config("Integration windows must be non-zero".to_string()));
        }
        if self.pipeline.algorithm_version.trim().is_empty() {
            return Err(Error::Config("algorithm_version must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Root folder resolution, highest priority first:
/// 1. Explicit argument
/// 2. Environment variable
/// 3. `root_folder` in the config
/// 4. OS-dependent default
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &PipelineConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_ENV_VAR) {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    get_default_root_folder()
}

fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("hfts"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/hfts"))
    } else {
        dirs::data_dir()
            .map(|d| d.join("hfts"))
            .unwrap_or_else(|| PathBuf::from("./hfts_data"))
    }
}
